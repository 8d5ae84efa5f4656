use crate::{
  configuration::{ClusterConfig, HealthCheckConfig},
  error::PolicyKind,
  model::{ActiveHealth, DestinationState, PassiveHealth},
  policy::{NamedPolicy, PolicyRegistry},
};
use log::warn;
use std::{fmt::Debug, sync::Arc};

pub const HEALTHY_AND_UNKNOWN: &str = "HealthyAndUnknown";
pub const HEALTHY_OR_PANIC: &str = "HealthyOrPanic";

/// Derives the available subset of a cluster's destinations. Runs whenever the cluster republishes
/// its destinations state, never on the request path.
pub trait AvailableDestinationsPolicy: NamedPolicy + Debug + Send + Sync {
  fn get_available_destinations(
    &self,
    config: &ClusterConfig,
    all: &[Arc<DestinationState>],
  ) -> Vec<Arc<DestinationState>>;
}

// A disabled axis counts as healthy, whatever it recorded while it was enabled.
fn is_available(config: &HealthCheckConfig, destination: &DestinationState) -> bool {
  let active_ok = !config.active.enabled || destination.health.active() != ActiveHealth::Unhealthy;
  let passive_ok = !config.passive.enabled || destination.health.passive() != PassiveHealth::Unhealthy;
  active_ok && passive_ok
}

fn healthy_and_unknown(config: &ClusterConfig, all: &[Arc<DestinationState>]) -> Vec<Arc<DestinationState>> {
  all
    .iter()
    .filter(|destination| is_available(&config.health_check, destination))
    .cloned()
    .collect()
}

#[derive(Debug, Default)]
pub struct HealthyAndUnknown;

impl NamedPolicy for HealthyAndUnknown {
  fn name(&self) -> &'static str {
    HEALTHY_AND_UNKNOWN
  }
}

impl AvailableDestinationsPolicy for HealthyAndUnknown {
  fn get_available_destinations(
    &self,
    config: &ClusterConfig,
    all: &[Arc<DestinationState>],
  ) -> Vec<Arc<DestinationState>> {
    healthy_and_unknown(config, all)
  }
}

/// Like [`HealthyAndUnknown`], but falls back to every destination when none is healthy.
#[derive(Debug, Default)]
pub struct HealthyOrPanic;

impl NamedPolicy for HealthyOrPanic {
  fn name(&self) -> &'static str {
    HEALTHY_OR_PANIC
  }
}

impl AvailableDestinationsPolicy for HealthyOrPanic {
  fn get_available_destinations(
    &self,
    config: &ClusterConfig,
    all: &[Arc<DestinationState>],
  ) -> Vec<Arc<DestinationState>> {
    let available = healthy_and_unknown(config, all);
    if available.is_empty() && !all.is_empty() {
      warn!(
        "cluster '{}': no healthy destinations, routing to all {} destinations",
        config.id,
        all.len()
      );
      return all.to_vec();
    }
    available
  }
}

pub fn builtin_policies() -> PolicyRegistry<dyn AvailableDestinationsPolicy> {
  let mut registry: PolicyRegistry<dyn AvailableDestinationsPolicy> =
    PolicyRegistry::new(PolicyKind::AvailableDestinations, HEALTHY_AND_UNKNOWN);
  registry
    .register(Arc::new(HealthyAndUnknown))
    .register(Arc::new(HealthyOrPanic));
  registry
}
