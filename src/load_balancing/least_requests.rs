use super::{LoadBalancingPolicy, LEAST_REQUESTS};
use crate::{
  model::{ClusterState, DestinationState},
  policy::NamedPolicy,
};
use hyper::{Body, Request};
use std::sync::Arc;

/// Full scan for the fewest requests in flight; the earliest candidate wins ties.
#[derive(Debug, Default)]
pub struct LeastRequests;

impl NamedPolicy for LeastRequests {
  fn name(&self) -> &'static str {
    LEAST_REQUESTS
  }
}

impl LoadBalancingPolicy for LeastRequests {
  fn pick_destination(
    &self,
    _request: &Request<Body>,
    _cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>> {
    available
      .iter()
      .min_by_key(|destination| destination.concurrent_requests())
      .cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::load_balancing::test_support::{destinations, request, with_requests};
  use proptest::prelude::*;

  #[test]
  pub fn least_requests_spreads_load() {
    let destinations = destinations(3);
    destinations[0].increment_requests();
    let cluster = ClusterState::new("c1");
    let strategy = LeastRequests;

    for _ in 0..10 {
      let expected = destinations
        .iter()
        .min_by_key(|d| d.concurrent_requests())
        .unwrap()
        .clone();
      let picked = strategy.pick_destination(&request(), &cluster, &destinations).unwrap();
      assert!(Arc::ptr_eq(&picked, &expected));
      picked.increment_requests();
    }
  }

  #[test]
  pub fn least_requests_tie_goes_to_first() {
    let destinations = with_requests(&[2, 1, 1]);
    let cluster = ClusterState::new("c1");

    let picked = LeastRequests.pick_destination(&request(), &cluster, &destinations).unwrap();

    assert_eq!(picked.id(), "d2");
  }

  proptest! {
    #[test]
    fn least_requests_finds_idle_destination(busy in prop::collection::vec(1usize..8, 1..8), idle in 0usize..8) {
      let mut counts = busy.clone();
      let idle = idle % (counts.len() + 1);
      counts.insert(idle, 0);
      let destinations = with_requests(&counts);
      let cluster = ClusterState::new("c1");

      let picked = LeastRequests.pick_destination(&request(), &cluster, &destinations).unwrap();

      prop_assert_eq!(picked.concurrent_requests(), 0);
    }
  }
}
