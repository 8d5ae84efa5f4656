use crate::{
  error::PolicyKind,
  model::{ClusterState, DestinationState},
  policy::{NamedPolicy, PolicyRegistry},
  random::RandomSource,
};
use hyper::{Body, Request};
use std::sync::Arc;

pub mod first;
pub mod least_requests;
pub mod power_of_two_choices;
pub mod random;
pub mod round_robin;

pub const FIRST: &str = "First";
pub const RANDOM: &str = "Random";
pub const ROUND_ROBIN: &str = "RoundRobin";
pub const POWER_OF_TWO_CHOICES: &str = "PowerOfTwoChoices";
pub const LEAST_REQUESTS: &str = "LeastRequests";

/// Picks one destination out of the candidates left after affinity narrowing.
///
/// Implementations must be total: an empty `available` slice yields `None` and anything else yields
/// one of its elements. Concurrency counters are read without locking; they are load hints only.
pub trait LoadBalancingPolicy: NamedPolicy + std::fmt::Debug + Send + Sync {
  fn pick_destination(
    &self,
    request: &Request<Body>,
    cluster: &ClusterState,
    available: &[Arc<DestinationState>],
  ) -> Option<Arc<DestinationState>>;
}

pub fn builtin_policies(random: Arc<dyn RandomSource>) -> PolicyRegistry<dyn LoadBalancingPolicy> {
  let mut registry: PolicyRegistry<dyn LoadBalancingPolicy> =
    PolicyRegistry::new(PolicyKind::LoadBalancing, POWER_OF_TWO_CHOICES);
  registry
    .register(Arc::new(first::First))
    .register(Arc::new(random::Random::new(random.clone())))
    .register(Arc::new(round_robin::RoundRobin))
    .register(Arc::new(power_of_two_choices::PowerOfTwoChoices::new(random)))
    .register(Arc::new(least_requests::LeastRequests));
  registry
}
