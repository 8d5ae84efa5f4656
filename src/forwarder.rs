use crate::error::ForwardError;
use async_trait::async_trait;
use hyper::{
  client::HttpConnector,
  header::{HeaderValue, HOST},
  Body, Client, Request, Response, Uri, Version,
};
use hyper_timeout::TimeoutConnector;
use std::{fmt::Debug, net::SocketAddr, time::Duration};

/// How a forwarded request ended, as seen by passive health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
  Success,
  UpstreamError,
  Timeout,
  Canceled,
}

impl ForwardOutcome {
  pub fn of(result: &Result<Response<Body>, ForwardError>) -> ForwardOutcome {
    match result {
      Ok(_) => ForwardOutcome::Success,
      Err(ForwardError::Upstream(_)) => ForwardOutcome::UpstreamError,
      Err(ForwardError::Timeout) => ForwardOutcome::Timeout,
      Err(ForwardError::Canceled) => ForwardOutcome::Canceled,
    }
  }
}

/// Remote address of the connection a request arrived on. Stored in the request extensions by the
/// server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddress(pub SocketAddr);

/// Moves a request to the chosen destination and returns its response.
#[async_trait]
pub trait Forwarder: Debug + Send + Sync {
  async fn forward(
    &self,
    request: Request<Body>,
    destination_address: &str,
    activity_timeout: Duration,
  ) -> Result<Response<Body>, ForwardError>;
}

#[derive(Debug, Clone)]
pub struct HttpForwarder {
  client: Client<TimeoutConnector<HttpConnector>, Body>,
}

impl HttpForwarder {
  pub fn new(connect_timeout: Duration) -> HttpForwarder {
    let mut connector = TimeoutConnector::new(HttpConnector::new());
    connector.set_connect_timeout(Some(connect_timeout));
    HttpForwarder {
      client: Client::builder().build(connector),
    }
  }
}

#[async_trait]
impl Forwarder for HttpForwarder {
  async fn forward(
    &self,
    request: Request<Body>,
    destination_address: &str,
    activity_timeout: Duration,
  ) -> Result<Response<Body>, ForwardError> {
    let request = backend_request(destination_address, request)?;
    match tokio::time::timeout(activity_timeout, self.client.request(request)).await {
      Ok(Ok(response)) => Ok(response),
      Ok(Err(e)) if e.is_canceled() => Err(ForwardError::Canceled),
      Ok(Err(e)) if e.is_timeout() => Err(ForwardError::Timeout),
      Ok(Err(e)) => Err(ForwardError::Upstream(e.to_string())),
      Err(_) => Err(ForwardError::Timeout),
    }
  }
}

/// The request's path and query appended to the destination address.
pub fn backend_uri(destination_address: &str, client_uri: &Uri) -> Result<Uri, ForwardError> {
  let path_and_query = client_uri.path_and_query().map_or("/", |p| p.as_str());
  let uri = format!("{}{}", destination_address.trim_end_matches('/'), path_and_query);
  uri
    .parse()
    .map_err(|e| ForwardError::Upstream(format!("invalid destination uri {}: {}", uri, e)))
}

fn backend_request(destination_address: &str, client_request: Request<Body>) -> Result<Request<Body>, ForwardError> {
  let (mut parts, body) = client_request.into_parts();
  parts.uri = backend_uri(destination_address, &parts.uri)?;
  parts.version = Version::HTTP_11;
  // hyper derives it from the destination uri
  parts.headers.remove(HOST);
  if let Some(ClientAddress(address)) = parts.extensions.get::<ClientAddress>() {
    if let Ok(value) = HeaderValue::from_str(&address.ip().to_string()) {
      parts.headers.append("x-forwarded-for", value);
    }
  }
  Ok(Request::from_parts(parts, body))
}
