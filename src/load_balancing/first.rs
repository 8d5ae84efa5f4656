use super::{LoadBalancingPolicy, FIRST};
use crate::{
  model::{ClusterState, DestinationState},
  policy::NamedPolicy,
};
use hyper::{Body, Request};
use std::sync::Arc;

/// Always the first candidate, ignoring load.
#[derive(Debug, Default)]
pub struct First;

impl NamedPolicy for First {
  fn name(&self) -> &'static str {
    FIRST
  }
}

impl LoadBalancingPolicy for First {
  fn pick_destination(
    &self,
    _request: &Request<Body>,
    _cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>> {
    available.first().cloned()
  }
}
