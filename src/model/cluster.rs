use super::destination::DestinationState;
use crate::{
  configuration::{ClusterConfig, DestinationConfig, SessionAffinityConfig},
  health::{
    active::ActiveHealthCheckPolicy,
    available_destinations::{AvailableDestinationsPolicy, HealthyAndUnknown},
    passive::PassiveHealthCheckPolicy,
  },
  load_balancing::{power_of_two_choices::PowerOfTwoChoices, LoadBalancingPolicy},
  random::ThreadRandom,
  session_affinity::{failure_policy::AffinityFailurePolicy, SessionAffinityPolicy},
};
use arc_swap::ArcSwap;
use log::debug;
use std::{
  collections::BTreeMap,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, PoisonError,
  },
};
use tokio_util::sync::CancellationToken;

/// Immutable snapshot of a cluster's destinations, published as a whole.
///
/// Both lists are ordered by destination id and `available` is a subset of `all`. A request keeps
/// the snapshot it loaded for its entire routing decision.
#[derive(Debug, Default)]
pub struct DestinationsState {
  pub all: Vec<Arc<DestinationState>>,
  pub available: Vec<Arc<DestinationState>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedAffinity {
  pub config: SessionAffinityConfig,
  pub policy: Arc<dyn SessionAffinityPolicy>,
  pub failure_policy: Arc<dyn AffinityFailurePolicy>,
}

/// A cluster configuration together with the policies its names resolved to.
#[derive(Debug, Clone)]
pub struct ClusterModel {
  pub config: ClusterConfig,
  pub load_balancing: Arc<dyn LoadBalancingPolicy>,
  /// Only present when affinity is enabled.
  pub session_affinity: Option<ResolvedAffinity>,
  pub available_destinations: Arc<dyn AvailableDestinationsPolicy>,
  /// Only present when active checks are enabled.
  pub active_health: Option<Arc<dyn ActiveHealthCheckPolicy>>,
  /// Only present when passive checks are enabled.
  pub passive_health: Option<Arc<dyn PassiveHealthCheckPolicy>>,
}

impl ClusterModel {
  pub fn new(config: ClusterConfig) -> ClusterModel {
    ClusterModel {
      config,
      load_balancing: Arc::new(PowerOfTwoChoices::new(Arc::new(ThreadRandom))),
      session_affinity: None,
      available_destinations: Arc::new(HealthyAndUnknown),
      active_health: None,
      passive_health: None,
    }
  }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DestinationsDiff {
  pub added: Vec<String>,
  pub updated: Vec<String>,
  pub removed: Vec<String>,
}

impl DestinationsDiff {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
  }
}

#[derive(Debug)]
pub struct ClusterState {
  id: String,
  model: ArcSwap<ClusterModel>,
  destinations: ArcSwap<BTreeMap<String, Arc<DestinationState>>>,
  destinations_state: ArcSwap<DestinationsState>,
  concurrent_requests: AtomicUsize,
  round_robin_cursor: AtomicUsize,
  update_lock: Mutex<()>,
  shutdown: CancellationToken,
}

impl ClusterState {
  pub fn new(id: impl Into<String>) -> ClusterState {
    let id = id.into();
    ClusterState {
      model: ArcSwap::from_pointee(ClusterModel::new(ClusterConfig::new(id.clone()))),
      id,
      destinations: ArcSwap::from_pointee(BTreeMap::new()),
      destinations_state: ArcSwap::from_pointee(DestinationsState::default()),
      concurrent_requests: AtomicUsize::new(0),
      round_robin_cursor: AtomicUsize::new(0),
      update_lock: Mutex::new(()),
      shutdown: CancellationToken::new(),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn model(&self) -> Arc<ClusterModel> {
    self.model.load_full()
  }

  pub(crate) fn set_model(&self, model: ClusterModel) {
    self.model.store(Arc::new(model));
  }

  pub fn destinations(&self) -> Arc<BTreeMap<String, Arc<DestinationState>>> {
    self.destinations.load_full()
  }

  pub fn destination(&self, id: &str) -> Option<Arc<DestinationState>> {
    self.destinations.load().get(id).cloned()
  }

  /// Reconciles the destination map with a configuration snapshot.
  ///
  /// Records whose id is still configured are kept (only their configuration is swapped), so their
  /// counters and health survive. Does not republish [`DestinationsState`].
  pub(crate) fn apply_destination_configs(&self, configs: &BTreeMap<String, DestinationConfig>) -> DestinationsDiff {
    let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let current = self.destinations.load_full();
    let mut diff = DestinationsDiff::default();
    let mut next = BTreeMap::new();

    for (id, config) in configs {
      let destination = match current.get(id) {
        Some(existing) => {
          if existing.replace_config(config) {
            diff.updated.push(id.clone());
          }
          existing.clone()
        }
        None => {
          diff.added.push(id.clone());
          Arc::new(DestinationState::with_config(id.clone(), config.clone()))
        }
      };
      next.insert(id.clone(), destination);
    }
    diff.removed = current.keys().filter(|id| !configs.contains_key(*id)).cloned().collect();

    if !diff.is_empty() {
      debug!(
        "cluster '{}': destinations added {:?}, updated {:?}, removed {:?}",
        self.id, diff.added, diff.updated, diff.removed
      );
      self.destinations.store(Arc::new(next));
    }
    diff
  }

  pub fn destinations_state(&self) -> Arc<DestinationsState> {
    self.destinations_state.load_full()
  }

  /// Recomputes the available destinations from current health and publishes a new snapshot.
  pub fn update_destinations_state(&self) {
    let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
    let model = self.model.load();
    let all: Vec<_> = self.destinations.load().values().cloned().collect();
    let available = model
      .available_destinations
      .get_available_destinations(&model.config, &all);
    self.destinations_state.store(Arc::new(DestinationsState { all, available }));
  }

  pub fn concurrent_requests(&self) -> usize {
    self.concurrent_requests.load(Ordering::Relaxed)
  }

  pub fn increment_requests(&self) {
    self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
  }

  pub fn decrement_requests(&self) {
    let _ = self
      .concurrent_requests
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| count.checked_sub(1));
  }

  /// Returns the current round-robin position and advances it. Wraps on overflow.
  pub fn next_round_robin(&self) -> usize {
    self.round_robin_cursor.fetch_add(1, Ordering::Relaxed)
  }

  /// Cancelled once the cluster is removed; background work for the cluster stops on it.
  pub fn shutdown_token(&self) -> &CancellationToken {
    &self.shutdown
  }

  pub(crate) fn shutdown(&self) {
    self.shutdown.cancel();
  }
}
