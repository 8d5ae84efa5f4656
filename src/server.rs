use crate::{
  dispatch::Dispatcher, error_response::not_found, forwarder::ClientAddress, model::ClusterState,
  registry::ClusterRegistry,
};
use futures::{Future, TryFutureExt};
use hyper::{
  header::HOST,
  http::uri::Authority,
  server::conn::AddrStream,
  service::{make_service_fn, Service},
  Body, Request, Response, Server,
};
use log::debug;
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

pub async fn create(address: SocketAddr, registry: Arc<ClusterRegistry>, dispatcher: Dispatcher) -> Result<(), io::Error> {
  let service = make_service_fn(move |stream: &AddrStream| {
    let client_address = stream.remote_addr();
    let registry = registry.clone();
    let dispatcher = dispatcher.clone();

    async move {
      Ok::<_, io::Error>(MainService {
        client_address,
        registry,
        dispatcher,
      })
    }
  });
  let builder = Server::try_bind(&address).map_err(|e| {
    let msg = format!("Failed to bind {}: {}", address, e);
    io::Error::new(io::ErrorKind::Other, msg)
  })?;
  builder
    .serve(service)
    .map_err(|e| {
      let msg = format!("Failed to listen server: {}", e);
      io::Error::new(io::ErrorKind::Other, msg)
    })
    .await
}

pub struct MainService {
  client_address: SocketAddr,
  registry: Arc<ClusterRegistry>,
  dispatcher: Dispatcher,
}

impl Service<Request<Body>> for MainService {
  type Response = Response<Body>;
  type Error = hyper::Error;

  #[allow(clippy::type_complexity)]
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, mut request: Request<Body>) -> Self::Future {
    debug!("{:#?} {} {}", request.version(), request.method(), request.uri());

    match cluster_by_req(&self.registry, &request) {
      Some(cluster) => {
        request.extensions_mut().insert(ClientAddress(self.client_address));
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move { Ok(dispatcher.dispatch(request, &cluster).await) })
      }
      None => Box::pin(async { Ok(not_found()) }),
    }
  }
}

/// Host of the request without its port. IPv6 literals keep their brackets.
fn request_host(request: &Request<Body>) -> Option<String> {
  match request.headers().get(HOST) {
    Some(value) => {
      let authority: Authority = value.to_str().ok()?.parse().ok()?;
      Some(authority.host().to_string())
    }
    None => request.uri().host().map(str::to_string),
  }
}

/// The cluster serving the request's host. Ties between clusters sharing a host go to the lowest id.
fn cluster_by_req(registry: &ClusterRegistry, request: &Request<Body>) -> Option<Arc<ClusterState>> {
  let host = request_host(request)?;
  registry
    .clusters()
    .values()
    .filter(|cluster| {
      cluster
        .model()
        .config
        .hosts
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(&host))
    })
    .min_by(|a, b| a.id().cmp(b.id()))
    .cloned()
}
