use crate::{
  forwarder::ForwardOutcome,
  model::{ClusterState, DestinationState},
};
use std::sync::Arc;

pub mod active;
pub mod available_destinations;
pub mod passive;
pub mod prober;

/// Reports the outcome of one forwarded request to the cluster's passive health policy.
///
/// Does nothing when passive checks are disabled for the cluster.
pub fn record_outcome(cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
  if let Some(policy) = &cluster.model().passive_health {
    policy.request_proxied(cluster, destination, outcome);
  }
}
