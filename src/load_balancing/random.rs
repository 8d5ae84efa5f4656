use super::{LoadBalancingPolicy, RANDOM};
use crate::{
  model::{ClusterState, DestinationState},
  policy::NamedPolicy,
  random::RandomSource,
};
use hyper::{Body, Request};
use std::sync::Arc;

#[derive(Debug)]
pub struct Random {
  random: Arc<dyn RandomSource>,
}

impl Random {
  pub fn new(random: Arc<dyn RandomSource>) -> Random {
    Random { random }
  }
}

impl NamedPolicy for Random {
  fn name(&self) -> &'static str {
    RANDOM
  }
}

impl LoadBalancingPolicy for Random {
  fn pick_destination(
    &self,
    _request: &Request<Body>,
    _cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>> {
    if available.is_empty() {
      return None;
    }
    let index = self.random.next_index(available.len());
    available.get(index).cloned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    load_balancing::test_support::{destinations, request},
    random::SequenceRandom,
  };

  #[test]
  pub fn random_follows_random_source() {
    let destinations = destinations(3);
    let cluster = ClusterState::new("c1");
    let sequence = vec![2, 0, 0, 1, 2, 1, 1, 0, 2, 2];
    let strategy = Random::new(Arc::new(SequenceRandom::new(sequence.clone())));

    for index in sequence {
      let picked = strategy.pick_destination(&request(), &cluster, &destinations).unwrap();
      assert!(Arc::ptr_eq(&picked, &destinations[index]));
      picked.increment_requests();
    }
  }
}
