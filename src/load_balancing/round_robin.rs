use super::{LoadBalancingPolicy, ROUND_ROBIN};
use crate::{
  model::{ClusterState, DestinationState},
  policy::NamedPolicy,
};
use hyper::{Body, Request};
use std::sync::Arc;

/// Cycles through the candidates using a cursor owned by the cluster, so clusters never perturb
/// each other's sequence.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl NamedPolicy for RoundRobin {
  fn name(&self) -> &'static str {
    ROUND_ROBIN
  }
}

impl LoadBalancingPolicy for RoundRobin {
  fn pick_destination(
    &self,
    _request: &Request<Body>,
    cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>> {
    if available.is_empty() {
      return None;
    }
    let index = cluster.next_round_robin() % available.len();
    available.get(index).cloned()
  }
}
