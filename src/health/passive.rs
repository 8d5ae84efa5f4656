use crate::{
  clock::Clock,
  error::PolicyKind,
  forwarder::ForwardOutcome,
  model::{ClusterState, DestinationState, PassiveHealth},
  policy::{NamedPolicy, PolicyRegistry},
};
use log::{info, warn};
use std::{
  collections::VecDeque,
  fmt::Debug,
  sync::{Arc, PoisonError},
  time::Duration,
};
use tokio::{runtime::Handle, time::Instant};

pub const TRANSPORT_FAILURE_RATE: &str = "TransportFailureRate";
pub const DETECTION_WINDOW_SIZE: &str = "TransportFailureRateHealthPolicy.DetectionWindowSize";
pub const MINIMAL_TOTAL_COUNT_THRESHOLD: &str = "TransportFailureRateHealthPolicy.MinimalTotalCountThreshold";
pub const RATE_LIMIT: &str = "TransportFailureRateHealthPolicy.RateLimit";

const DEFAULT_DETECTION_WINDOW_MS: u64 = 60_000;
const DEFAULT_MINIMAL_TOTAL_COUNT: usize = 10;
const DEFAULT_RATE_LIMIT: f64 = 0.3;

/// Outcomes observed within one second.
#[derive(Debug, Clone, Copy)]
struct Bucket {
  second: u64,
  total: usize,
  failures: usize,
}

/// Sliding window of request outcomes for one destination, counted in one-second buckets.
///
/// Holds at most one bucket per second of the window, whatever the request rate.
#[derive(Debug, Default)]
pub struct FailureWindow {
  origin: Option<Instant>,
  buckets: VecDeque<Bucket>,
  total: usize,
  failures: usize,
}

impl FailureWindow {
  pub fn add(&mut self, now: Instant, failed: bool, window: Duration) {
    let origin = *self.origin.get_or_insert(now);
    let second = now.saturating_duration_since(origin).as_secs();

    match self.buckets.back_mut() {
      Some(bucket) if bucket.second >= second => {
        bucket.total += 1;
        bucket.failures += usize::from(failed);
      }
      _ => self.buckets.push_back(Bucket {
        second,
        total: 1,
        failures: usize::from(failed),
      }),
    }
    self.total += 1;
    self.failures += usize::from(failed);

    let window_ms = window.as_millis();
    while let Some(bucket) = self.buckets.front() {
      let age_ms = u128::from(second.saturating_sub(bucket.second)) * 1000;
      if bucket.second >= second || age_ms < window_ms {
        break;
      }
      if let Some(expired) = self.buckets.pop_front() {
        self.total -= expired.total;
        self.failures -= expired.failures;
      }
    }
  }

  pub fn total(&self) -> usize {
    self.total
  }

  pub fn failure_rate(&self) -> f64 {
    if self.total == 0 {
      0.0
    } else {
      self.failures as f64 / self.total as f64
    }
  }

  pub fn clear(&mut self) {
    self.origin = None;
    self.buckets.clear();
    self.total = 0;
    self.failures = 0;
  }

  #[cfg(test)]
  fn bucket_count(&self) -> usize {
    self.buckets.len()
  }
}

/// Observes the outcome of every proxied request. Runs inline on the request path, so
/// implementations must not block.
pub trait PassiveHealthCheckPolicy: NamedPolicy + Debug + Send + Sync {
  fn request_proxied(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome);
}

/// Marks a destination unhealthy once enough requests were seen in the detection window and the
/// share of transport failures among them exceeds the rate limit. Canceled requests are ignored.
///
/// An unhealthy destination comes back after the cluster's reactivation period.
#[derive(Debug)]
pub struct TransportFailureRate {
  clock: Arc<dyn Clock>,
}

impl TransportFailureRate {
  pub fn new(clock: Arc<dyn Clock>) -> TransportFailureRate {
    TransportFailureRate { clock }
  }

  /// Schedules the destination's return after `period`. A later call supersedes this one, so the
  /// destination is only reactivated by the timer of its latest exclusion.
  fn schedule_reactivation(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, period: Duration) {
    let generation = destination.health.next_reactivation();
    let runtime = match Handle::try_current() {
      Ok(runtime) => runtime,
      Err(_) => {
        warn!(
          "cluster '{}': no async runtime, destination '{}' will not be reactivated",
          cluster.id(),
          destination.id()
        );
        return;
      }
    };

    let wake_up = self.clock.sleep_until(self.clock.now() + period);
    let shutdown = cluster.shutdown_token().clone();
    let cluster = cluster.clone();
    let destination = destination.clone();
    runtime.spawn(async move {
      tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = wake_up => {
          if !destination.health.is_current_reactivation(generation)
            || destination.health.passive() != PassiveHealth::Unhealthy
          {
            return;
          }
          destination
            .health
            .failure_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
          if destination.health.set_passive(PassiveHealth::Healthy) == PassiveHealth::Unhealthy {
            info!(
              "cluster '{}': destination '{}' reactivated after {:?}",
              cluster.id(),
              destination.id(),
              period
            );
            cluster.update_destinations_state();
          }
        }
      }
    });
  }
}

impl NamedPolicy for TransportFailureRate {
  fn name(&self) -> &'static str {
    TRANSPORT_FAILURE_RATE
  }
}

impl PassiveHealthCheckPolicy for TransportFailureRate {
  fn request_proxied(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
    let failed = match outcome {
      ForwardOutcome::Canceled => return,
      ForwardOutcome::Success => false,
      ForwardOutcome::UpstreamError | ForwardOutcome::Timeout => true,
    };

    let model = cluster.model();
    let config = &model.config;
    let window = Duration::from_millis(config.metadata_value(DETECTION_WINDOW_SIZE, DEFAULT_DETECTION_WINDOW_MS));
    let minimal_total = config.metadata_value(MINIMAL_TOTAL_COUNT_THRESHOLD, DEFAULT_MINIMAL_TOTAL_COUNT);
    let rate_limit = config.metadata_value(RATE_LIMIT, DEFAULT_RATE_LIMIT);

    let unhealthy = {
      let mut samples = destination
        .health
        .failure_window
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      samples.add(self.clock.now(), failed, window);
      samples.total() >= minimal_total && samples.failure_rate() > rate_limit
    };

    let new_health = if unhealthy {
      PassiveHealth::Unhealthy
    } else {
      PassiveHealth::Healthy
    };
    let previous = destination.health.set_passive(new_health);
    if previous == new_health {
      return;
    }

    cluster.update_destinations_state();
    if new_health == PassiveHealth::Unhealthy {
      let period = config.health_check.passive.reactivation_period();
      warn!(
        "cluster '{}': destination '{}' is passively unhealthy, excluded for {:?}",
        cluster.id(),
        destination.id(),
        period
      );
      self.schedule_reactivation(cluster, destination, period);
    } else {
      info!(
        "cluster '{}': destination '{}' is passively healthy again",
        cluster.id(),
        destination.id()
      );
    }
  }
}

pub fn builtin_policies(clock: Arc<dyn Clock>) -> PolicyRegistry<dyn PassiveHealthCheckPolicy> {
  let mut registry: PolicyRegistry<dyn PassiveHealthCheckPolicy> =
    PolicyRegistry::new(PolicyKind::PassiveHealthCheck, TRANSPORT_FAILURE_RATE);
  registry.register(Arc::new(TransportFailureRate::new(clock)));
  registry
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    clock::TokioClock,
    configuration::{ClusterConfig, DestinationConfig},
    model::ClusterModel,
  };
  use std::collections::BTreeMap;

  fn cluster(metadata: &[(&str, &str)]) -> Arc<ClusterState> {
    let mut config = ClusterConfig::new("c1");
    config.health_check.passive.enabled = true;
    config.health_check.passive.reactivation_period_ms = 30_000;
    for (key, value) in metadata {
      config.metadata.insert(key.to_string(), value.to_string());
    }
    let mut model = ClusterModel::new(config);
    model.passive_health = Some(Arc::new(TransportFailureRate::new(Arc::new(TokioClock))));

    let cluster = Arc::new(ClusterState::new("c1"));
    cluster.set_model(model);
    let mut destinations = BTreeMap::new();
    destinations.insert(
      "d1".to_string(),
      DestinationConfig {
        address: "http://d1.localhost".into(),
        ..DestinationConfig::default()
      },
    );
    cluster.apply_destination_configs(&destinations);
    cluster.update_destinations_state();
    cluster
  }

  fn report(cluster: &Arc<ClusterState>, outcome: ForwardOutcome, times: usize) {
    let destination = cluster.destination("d1").unwrap();
    let policy = cluster.model().passive_health.clone().unwrap();
    for _ in 0..times {
      policy.request_proxied(cluster, &destination, outcome);
    }
  }

  fn passive(cluster: &ClusterState) -> PassiveHealth {
    cluster.destination("d1").unwrap().health.passive()
  }

  #[test]
  pub fn failure_window_drops_old_samples() {
    let mut window = FailureWindow::default();
    let start = Instant::now();

    window.add(start, true, Duration::from_secs(10));
    window.add(start + Duration::from_secs(5), false, Duration::from_secs(10));
    assert_eq!(window.total(), 2);
    assert_eq!(window.failure_rate(), 0.5);

    window.add(start + Duration::from_secs(11), false, Duration::from_secs(10));
    assert_eq!(window.total(), 2);
    assert_eq!(window.failure_rate(), 0.0);
  }

  #[test]
  pub fn failure_window_is_bounded_by_its_length() {
    let mut window = FailureWindow::default();
    let start = Instant::now();
    let length = Duration::from_secs(60);

    for ms in (0..600_000u64).step_by(10) {
      window.add(start + Duration::from_millis(ms), ms % 20 == 0, length);
    }

    assert!(window.bucket_count() <= 61);
    assert_eq!(window.total(), 6_000);
    assert_eq!(window.failure_rate(), 0.5);
  }

  #[tokio::test(start_paused = true)]
  async fn below_minimal_count_stays_healthy() {
    let cluster = cluster(&[]);

    report(&cluster, ForwardOutcome::UpstreamError, 9);

    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
  }

  #[tokio::test(start_paused = true)]
  async fn tenth_failure_marks_unhealthy() {
    let cluster = cluster(&[]);

    report(&cluster, ForwardOutcome::Timeout, 10);

    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);
    assert!(cluster.destinations_state().available.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn rate_below_limit_stays_healthy() {
    let cluster = cluster(&[(RATE_LIMIT, "0.5")]);

    report(&cluster, ForwardOutcome::Success, 6);
    report(&cluster, ForwardOutcome::UpstreamError, 4);

    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
  }

  #[tokio::test(start_paused = true)]
  async fn canceled_requests_are_ignored() {
    let cluster = cluster(&[(MINIMAL_TOTAL_COUNT_THRESHOLD, "1")]);

    report(&cluster, ForwardOutcome::Canceled, 20);

    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
    assert_eq!(
      cluster.destination("d1").unwrap().health.failure_window.lock().unwrap().total(),
      0
    );
  }

  #[tokio::test(start_paused = true)]
  async fn failures_outside_window_are_forgotten() {
    let cluster = cluster(&[(DETECTION_WINDOW_SIZE, "1000")]);

    report(&cluster, ForwardOutcome::UpstreamError, 9);
    tokio::time::advance(Duration::from_millis(1_500)).await;
    report(&cluster, ForwardOutcome::UpstreamError, 1);

    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
  }

  #[tokio::test(start_paused = true)]
  async fn destination_is_reactivated_after_period() {
    let cluster = cluster(&[]);
    report(&cluster, ForwardOutcome::UpstreamError, 10);
    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);

    tokio::time::sleep(Duration::from_millis(29_000)).await;
    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);

    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
    assert_eq!(cluster.destinations_state().available.len(), 1);
    assert_eq!(
      cluster.destination("d1").unwrap().health.failure_window.lock().unwrap().total(),
      0
    );
  }

  #[tokio::test(start_paused = true)]
  async fn renewed_exclusion_restarts_reactivation_period() {
    let cluster = cluster(&[]);
    report(&cluster, ForwardOutcome::UpstreamError, 10);
    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    report(&cluster, ForwardOutcome::Success, 30);
    assert_eq!(passive(&cluster), PassiveHealth::Healthy);

    tokio::time::sleep(Duration::from_millis(19_000)).await;
    report(&cluster, ForwardOutcome::UpstreamError, 10);
    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);

    tokio::time::sleep(Duration::from_millis(10_001)).await;
    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);
    assert!(cluster.destinations_state().available.is_empty());

    tokio::time::sleep(Duration::from_millis(20_000)).await;
    assert_eq!(passive(&cluster), PassiveHealth::Healthy);
    assert_eq!(cluster.destinations_state().available.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn cluster_shutdown_cancels_reactivation() {
    let cluster = cluster(&[]);
    report(&cluster, ForwardOutcome::UpstreamError, 10);

    cluster.shutdown();
    tokio::time::sleep(Duration::from_millis(60_000)).await;

    assert_eq!(passive(&cluster), PassiveHealth::Unhealthy);
  }
}
