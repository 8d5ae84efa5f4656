use super::active::HealthProber;
use crate::{
  configuration::{ActiveHealthCheckConfig, DestinationConfig},
  error::ProbeError,
  model::DestinationState,
};
use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, StatusCode, Uri};
use hyper_timeout::TimeoutConnector;

/// Probes destinations with a plain HTTP GET.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProber;

#[async_trait]
impl HealthProber for HttpProber {
  async fn probe(
    &self,
    destination: &DestinationState,
    config: &ActiveHealthCheckConfig,
  ) -> Result<StatusCode, ProbeError> {
    let uri = probe_uri(&destination.config(), config.path.as_deref())?;
    let timeout = config.timeout();

    let mut connector = TimeoutConnector::new(HttpConnector::new());
    connector.set_connect_timeout(Some(timeout));
    connector.set_read_timeout(Some(timeout));
    connector.set_write_timeout(Some(timeout));
    let client = Client::builder().build::<_, Body>(connector);

    match tokio::time::timeout(timeout, client.get(uri)).await {
      Ok(Ok(response)) => Ok(response.status()),
      Ok(Err(e)) if e.is_timeout() => Err(ProbeError::Timeout),
      Ok(Err(e)) => Err(ProbeError::Request(e.to_string())),
      Err(_) => Err(ProbeError::Timeout),
    }
  }
}

/// The health address of the destination (its regular address when it has none) joined with
/// `path`.
pub fn probe_uri(destination: &DestinationConfig, path: Option<&str>) -> Result<Uri, ProbeError> {
  let base = destination
    .health
    .as_deref()
    .unwrap_or(&destination.address)
    .trim_end_matches('/');
  let uri = match path {
    Some(path) if !path.is_empty() => format!("{}/{}", base, path.trim_start_matches('/')),
    _ => format!("{}/", base),
  };
  uri
    .parse::<Uri>()
    .map_err(|e| ProbeError::InvalidUri(format!("{}: {}", uri, e)))
}
