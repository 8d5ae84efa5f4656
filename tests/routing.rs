use arlb_routing::{
  clock::{Clock, TokioClock},
  configuration::{ClusterConfig, SessionAffinityConfig},
  forwarder::ForwardOutcome,
  health::{
    active::{ActiveHealthCheckMonitor, HealthProber},
    passive::{PassiveHealthCheckPolicy, TransportFailureRate},
    prober::HttpProber,
  },
  model::{ActiveHealth, DestinationState, PassiveHealth},
  policy::NamedPolicy,
  random::ThreadRandom,
  session_affinity::protector::AesGcmProtector,
  ClusterRegistry, ClusterState, Dispatcher, ForwardError, Forwarder, Policies, RoutingError,
};
use async_trait::async_trait;
use hyper::{
  header::{COOKIE, HOST, SET_COOKIE},
  service::{make_service_fn, service_fn},
  Body, Request, Response, Server, StatusCode,
};
use std::{
  convert::Infallible,
  net::SocketAddr,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::sync::Semaphore;
use tokio_test::assert_ok;

const AFFINITY_KEY: &str = ".Arlb.Affinity";

/// Answers with the address it was asked to forward to.
#[derive(Debug)]
struct Echo;

#[async_trait]
impl Forwarder for Echo {
  async fn forward(&self, _: Request<Body>, destination_address: &str, _: Duration) -> Result<Response<Body>, ForwardError> {
    Ok(Response::new(Body::from(destination_address.to_string())))
  }
}

#[derive(Debug)]
struct Refused;

#[async_trait]
impl Forwarder for Refused {
  async fn forward(&self, _: Request<Body>, _: &str, _: Duration) -> Result<Response<Body>, ForwardError> {
    Err(ForwardError::Upstream("connection refused".into()))
  }
}

/// Holds every request until the test hands out permits.
#[derive(Debug)]
struct Gate(Arc<Semaphore>);

#[async_trait]
impl Forwarder for Gate {
  async fn forward(&self, _: Request<Body>, _: &str, _: Duration) -> Result<Response<Body>, ForwardError> {
    let permit = self.0.acquire().await.map_err(|_| ForwardError::Canceled)?;
    permit.forget();
    Ok(Response::new(Body::empty()))
  }
}

/// Never answers.
#[derive(Debug)]
struct Stalled;

#[async_trait]
impl Forwarder for Stalled {
  async fn forward(&self, _: Request<Body>, _: &str, _: Duration) -> Result<Response<Body>, ForwardError> {
    futures::future::pending().await
  }
}

/// Transport failure rate that also counts what it was told.
#[derive(Debug)]
struct CountingFailureRate {
  inner: TransportFailureRate,
  reported: AtomicUsize,
  canceled: AtomicUsize,
}

impl NamedPolicy for CountingFailureRate {
  fn name(&self) -> &'static str {
    "CountingFailureRate"
  }
}

impl PassiveHealthCheckPolicy for CountingFailureRate {
  fn request_proxied(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
    self.reported.fetch_add(1, Ordering::SeqCst);
    if outcome == ForwardOutcome::Canceled {
      self.canceled.fetch_add(1, Ordering::SeqCst);
    }
    self.inner.request_proxied(cluster, destination, outcome);
  }
}

fn registry() -> ClusterRegistry {
  let clock: Arc<dyn Clock> = Arc::new(TokioClock);
  let policies = Policies::builtin(Arc::new(ThreadRandom), clock.clone(), Arc::new(AesGcmProtector::generate()));
  ClusterRegistry::new(policies, ActiveHealthCheckMonitor::new(Arc::new(HttpProber), clock))
}

fn request() -> Request<Body> {
  Request::builder()
    .uri("/api")
    .header(HOST, "whoami.localhost")
    .body(Body::empty())
    .unwrap()
}

async fn body_string(response: Response<Body>) -> String {
  let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
  String::from_utf8(bytes.to_vec()).unwrap()
}

async fn start_backend(name: &'static str) -> SocketAddr {
  let service = make_service_fn(move |_| async move {
    Ok::<_, Infallible>(service_fn(move |request: Request<Body>| async move {
      let body = format!("{} {}", name, request.uri().path());
      Ok::<_, Infallible>(Response::new(Body::from(body)))
    }))
  });
  let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(service);
  let address = server.local_addr();
  tokio::spawn(server);
  address
}

#[tokio::test(start_paused = true)]
async fn failing_destination_is_excluded_then_reactivated() {
  let registry = registry();
  let mut config = ClusterConfig::new("c1").with_destination("d1", "http://127.0.0.1:1");
  config.health_check.passive.enabled = true;
  config.health_check.passive.reactivation_period_ms = 30_000;
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let dispatcher = Dispatcher::new(Arc::new(Refused));

  let mut statuses = Vec::new();
  for _ in 0..42 {
    statuses.push(dispatcher.dispatch(request(), &cluster).await.status());
  }

  assert!(statuses[..10].iter().all(|status| *status == StatusCode::BAD_GATEWAY));
  assert!(statuses[10..].iter().all(|status| *status == StatusCode::SERVICE_UNAVAILABLE));
  let destination = cluster.destination("d1").unwrap();
  assert_eq!(destination.health.passive(), PassiveHealth::Unhealthy);
  assert_eq!(destination.concurrent_requests(), 0);

  tokio::time::sleep(Duration::from_millis(30_001)).await;

  assert_eq!(destination.health.passive(), PassiveHealth::Healthy);
  assert_eq!(cluster.destinations_state().available.len(), 1);
  assert_eq!(
    dispatcher.dispatch(request(), &cluster).await.status(),
    StatusCode::BAD_GATEWAY
  );
}

#[tokio::test]
async fn cookie_affinity_pins_client_to_destination() {
  let registry = registry();
  let mut config = ClusterConfig::new("c1")
    .with_destination("d1", "http://d1.localhost")
    .with_destination("d2", "http://d2.localhost");
  config.load_balancing_policy = Some("RoundRobin".into());
  config.session_affinity = Some(SessionAffinityConfig {
    enabled: true,
    affinity_key_name: AFFINITY_KEY.into(),
    ..SessionAffinityConfig::default()
  });
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let dispatcher = Dispatcher::new(Arc::new(Echo));

  let first = dispatcher.dispatch(request(), &cluster).await;
  let set_cookie = first.headers().get(SET_COOKIE).unwrap().to_str().unwrap().to_string();
  let cookie = cookie::Cookie::parse(set_cookie).unwrap();
  assert_eq!(cookie.name(), AFFINITY_KEY);
  assert_eq!(body_string(first).await, "http://d1.localhost");

  for _ in 0..3 {
    let mut request = request();
    let header = format!("theme=dark; {}={}", AFFINITY_KEY, cookie.value());
    request.headers_mut().insert(COOKIE, header.parse().unwrap());

    let response = dispatcher.dispatch(request, &cluster).await;

    assert!(response.headers().get(SET_COOKIE).is_none());
    assert_eq!(body_string(response).await, "http://d1.localhost");
  }
}

#[tokio::test]
async fn forged_affinity_cookie_is_redistributed() {
  let registry = registry();
  let mut config = ClusterConfig::new("c1").with_destination("d1", "http://d1.localhost");
  config.session_affinity = Some(SessionAffinityConfig {
    enabled: true,
    affinity_key_name: AFFINITY_KEY.into(),
    ..SessionAffinityConfig::default()
  });
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let dispatcher = Dispatcher::new(Arc::new(Echo));
  let mut request = request();
  let header = format!("{}=ZGVzdC1B", AFFINITY_KEY);
  request.headers_mut().insert(COOKIE, header.parse().unwrap());

  let response = dispatcher.dispatch(request, &cluster).await;

  assert_eq!(response.status(), StatusCode::OK);
  assert!(response.headers().get(SET_COOKIE).is_some());
}

#[tokio::test]
async fn concurrent_requests_release_their_counters() {
  let registry = registry();
  let config = ClusterConfig::new("c1")
    .with_destination("d1", "http://d1.localhost")
    .with_destination("d2", "http://d2.localhost");
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let gate = Arc::new(Semaphore::new(0));
  let dispatcher = Dispatcher::new(Arc::new(Gate(gate.clone())));

  let handles: Vec<_> = (0..8)
    .map(|_| {
      let dispatcher = dispatcher.clone();
      let cluster = cluster.clone();
      tokio::spawn(async move { dispatcher.dispatch(request(), &cluster).await.status() })
    })
    .collect();
  for _ in 0..100 {
    if cluster.concurrent_requests() == 8 {
      break;
    }
    tokio::task::yield_now().await;
  }

  assert_eq!(cluster.concurrent_requests(), 8);
  let in_flight: usize = cluster.destinations().values().map(|d| d.concurrent_requests()).sum();
  assert_eq!(in_flight, 8);

  gate.add_permits(8);
  for handle in handles {
    assert_eq!(handle.await.unwrap(), StatusCode::OK);
  }

  assert_eq!(cluster.concurrent_requests(), 0);
  assert!(cluster.destinations().values().all(|d| d.concurrent_requests() == 0));
}

#[tokio::test]
async fn aborted_requests_leave_passive_health_unaffected() {
  let clock: Arc<dyn Clock> = Arc::new(TokioClock);
  let counting = Arc::new(CountingFailureRate {
    inner: TransportFailureRate::new(clock.clone()),
    reported: AtomicUsize::new(0),
    canceled: AtomicUsize::new(0),
  });
  let mut policies = Policies::builtin(Arc::new(ThreadRandom), clock.clone(), Arc::new(AesGcmProtector::generate()));
  policies.passive_health.register(counting.clone());
  let registry = ClusterRegistry::new(policies, ActiveHealthCheckMonitor::new(Arc::new(HttpProber), clock));
  let mut config = ClusterConfig::new("c1").with_destination("d1", "http://d1.localhost");
  config.health_check.passive.enabled = true;
  config.health_check.passive.policy = Some("CountingFailureRate".into());
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let stalled = Dispatcher::new(Arc::new(Stalled));

  let handles: Vec<_> = (0..42)
    .map(|_| {
      let dispatcher = stalled.clone();
      let cluster = cluster.clone();
      tokio::spawn(async move { dispatcher.dispatch(request(), &cluster).await })
    })
    .collect();
  for _ in 0..100 {
    if cluster.concurrent_requests() == 42 {
      break;
    }
    tokio::task::yield_now().await;
  }
  assert_eq!(cluster.concurrent_requests(), 42);

  for handle in handles {
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
  }

  let destination = cluster.destination("d1").unwrap();
  assert_eq!(cluster.concurrent_requests(), 0);
  assert_eq!(destination.concurrent_requests(), 0);
  assert_eq!(destination.health.passive(), PassiveHealth::Healthy);
  assert_eq!(counting.canceled.load(Ordering::SeqCst), 42);
  assert_eq!(counting.reported.load(Ordering::SeqCst), 42);

  let response = Dispatcher::new(Arc::new(Echo)).dispatch(request(), &cluster).await;
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(counting.reported.load(Ordering::SeqCst), 43);
  assert_eq!(counting.canceled.load(Ordering::SeqCst), 42);
}

#[tokio::test]
async fn empty_cluster_is_unavailable() {
  let registry = registry();
  let cluster = assert_ok!(registry.on_configuration_changed(ClusterConfig::new("c1")));
  let dispatcher = Dispatcher::new(Arc::new(Echo));

  let error = dispatcher.pick_destination(&request(), &cluster).unwrap_err();
  assert_eq!(error.routing_error(), Some(RoutingError::NoAvailableDestinations));
  assert_eq!(
    dispatcher.dispatch(request(), &cluster).await.status(),
    StatusCode::SERVICE_UNAVAILABLE
  );
}

#[tokio::test]
async fn http_forwarder_reaches_backend() {
  let address = start_backend("backend-1").await;
  let registry = registry();
  let config = ClusterConfig::new("c1").with_destination("d1", format!("http://{}", address));
  let cluster: Arc<ClusterState> = assert_ok!(registry.on_configuration_changed(config));
  let dispatcher = Dispatcher::new(Arc::new(arlb_routing::forwarder::HttpForwarder::new(
    Duration::from_secs(5),
  )));

  let response = dispatcher.dispatch(request(), &cluster).await;

  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(body_string(response).await, "backend-1 /api");
}

#[tokio::test]
async fn http_prober_reports_backend_status() {
  let address = start_backend("backend-1").await;
  let registry = registry();
  let mut config = ClusterConfig::new("c1").with_destination("d1", format!("http://{}", address));
  config.health_check.active.enabled = true;
  config.health_check.active.path = Some("/health".into());
  let cluster = assert_ok!(registry.on_configuration_changed(config));
  let destination = cluster.destination("d1").unwrap();

  let status = HttpProber
    .probe(&destination, &cluster.model().config.health_check.active)
    .await;
  assert_eq!(status, Ok(StatusCode::OK));

  for _ in 0..200 {
    if destination.health.active() == ActiveHealth::Healthy {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(destination.health.active(), ActiveHealth::Healthy);
  registry.remove_cluster("c1");
}
