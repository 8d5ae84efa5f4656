use super::{LoadBalancingPolicy, POWER_OF_TWO_CHOICES};
use crate::{
  model::{ClusterState, DestinationState},
  policy::NamedPolicy,
  random::RandomSource,
};
use hyper::{Body, Request};
use std::sync::Arc;

/// Samples two candidates (with replacement) and keeps the one with fewer requests in flight.
/// On a tie the first sample wins.
#[derive(Debug)]
pub struct PowerOfTwoChoices {
  random: Arc<dyn RandomSource>,
}

impl PowerOfTwoChoices {
  pub fn new(random: Arc<dyn RandomSource>) -> PowerOfTwoChoices {
    PowerOfTwoChoices { random }
  }
}

impl NamedPolicy for PowerOfTwoChoices {
  fn name(&self) -> &'static str {
    POWER_OF_TWO_CHOICES
  }
}

impl LoadBalancingPolicy for PowerOfTwoChoices {
  fn pick_destination(
    &self,
    _request: &Request<Body>,
    _cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>> {
    match available.len() {
      0 => None,
      1 => available.first().cloned(),
      count => {
        let first = &available[self.random.next_index(count)];
        let second = &available[self.random.next_index(count)];
        if first.concurrent_requests() <= second.concurrent_requests() {
          Some(first.clone())
        } else {
          Some(second.clone())
        }
      }
    }
  }
}
