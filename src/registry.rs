use crate::{
  clock::Clock,
  configuration::ClusterConfig,
  error::ConfigurationError,
  forwarder::ForwardOutcome,
  health::{
    self,
    active::{self as active_health, ActiveHealthCheckMonitor, ActiveHealthCheckPolicy, ProbeTask},
    available_destinations::{self, AvailableDestinationsPolicy},
    passive::{self as passive_health, PassiveHealthCheckPolicy},
  },
  load_balancing::{self, LoadBalancingPolicy},
  model::{ClusterModel, ClusterState, DestinationState, DestinationsState, ResolvedAffinity},
  policy::PolicyRegistry,
  random::RandomSource,
  session_affinity::{
    self,
    failure_policy::{self, AffinityFailurePolicy},
    protector::DataProtector,
    SessionAffinityPolicy,
  },
};
use arc_swap::ArcSwap;
use hyper::header::HeaderName;
use log::{info, warn};
use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex, PoisonError},
};

/// Every policy a cluster configuration can name, by kind.
#[derive(Debug)]
pub struct Policies {
  pub load_balancing: PolicyRegistry<dyn LoadBalancingPolicy>,
  pub session_affinity: PolicyRegistry<dyn SessionAffinityPolicy>,
  pub affinity_failure: PolicyRegistry<dyn AffinityFailurePolicy>,
  pub available_destinations: PolicyRegistry<dyn AvailableDestinationsPolicy>,
  pub active_health: PolicyRegistry<dyn ActiveHealthCheckPolicy>,
  pub passive_health: PolicyRegistry<dyn PassiveHealthCheckPolicy>,
}

impl Policies {
  pub fn builtin(random: Arc<dyn RandomSource>, clock: Arc<dyn Clock>, protector: Arc<dyn DataProtector>) -> Policies {
    Policies {
      load_balancing: load_balancing::builtin_policies(random),
      session_affinity: session_affinity::builtin_policies(protector),
      affinity_failure: failure_policy::builtin_failure_policies(),
      available_destinations: available_destinations::builtin_policies(),
      active_health: active_health::builtin_policies(),
      passive_health: passive_health::builtin_policies(clock),
    }
  }

  /// Validates `config` and resolves the policies it names. Policies of disabled features are not
  /// looked up.
  pub fn resolve(&self, config: ClusterConfig) -> Result<ClusterModel, ConfigurationError> {
    if config.id.trim().is_empty() {
      return Err(ConfigurationError::EmptyClusterId);
    }
    let id = config.id.as_str();

    if let Some((destination, _)) = config
      .destinations
      .iter()
      .find(|(_, destination)| destination.address.trim().is_empty())
    {
      return Err(ConfigurationError::MissingDestinationAddress {
        cluster: id.to_string(),
        destination: destination.clone(),
      });
    }

    if config.http_request.activity_timeout_ms == 0 {
      return Err(ConfigurationError::ZeroActivityTimeout { cluster: id.to_string() });
    }

    let load_balancing = self
      .load_balancing
      .resolve(id, config.load_balancing_policy.as_deref())?;

    let session_affinity = match &config.session_affinity {
      Some(affinity) if affinity.enabled => {
        if HeaderName::from_bytes(affinity.affinity_key_name.as_bytes()).is_err() {
          return Err(ConfigurationError::InvalidAffinityKeyName {
            cluster: id.to_string(),
            name: affinity.affinity_key_name.clone(),
          });
        }
        Some(ResolvedAffinity {
          config: affinity.clone(),
          policy: self.session_affinity.resolve(id, affinity.policy.as_deref())?,
          failure_policy: self.affinity_failure.resolve(id, affinity.failure_policy.as_deref())?,
        })
      }
      _ => None,
    };

    let health_check = &config.health_check;
    let available_destinations = self
      .available_destinations
      .resolve(id, health_check.available_destinations_policy.as_deref())?;

    let active_health = if health_check.active.enabled {
      if health_check.active.interval_ms == 0 {
        return Err(ConfigurationError::ZeroProbeInterval { cluster: id.to_string() });
      }
      if health_check.active.timeout_ms == 0 {
        return Err(ConfigurationError::ZeroProbeTimeout { cluster: id.to_string() });
      }
      Some(self.active_health.resolve(id, health_check.active.policy.as_deref())?)
    } else {
      None
    };

    let passive_health = if health_check.passive.enabled {
      Some(self.passive_health.resolve(id, health_check.passive.policy.as_deref())?)
    } else {
      None
    };

    Ok(ClusterModel {
      config,
      load_balancing,
      session_affinity,
      available_destinations,
      active_health,
      passive_health,
    })
  }
}

/// The live set of clusters, kept in line with configuration snapshots.
///
/// Configuration updates are serialized; readers load the cluster map without locking.
#[derive(Debug)]
pub struct ClusterRegistry {
  policies: Policies,
  monitor: ActiveHealthCheckMonitor,
  clusters: ArcSwap<HashMap<String, Arc<ClusterState>>>,
  probe_tasks: Mutex<HashMap<String, ProbeTask>>,
  update_lock: Mutex<()>,
}

impl ClusterRegistry {
  pub fn new(policies: Policies, monitor: ActiveHealthCheckMonitor) -> ClusterRegistry {
    ClusterRegistry {
      policies,
      monitor,
      clusters: ArcSwap::from_pointee(HashMap::new()),
      probe_tasks: Mutex::new(HashMap::new()),
      update_lock: Mutex::new(()),
    }
  }

  pub fn policies(&self) -> &Policies {
    &self.policies
  }

  /// Applies the configuration of one cluster, creating the cluster when it is new.
  ///
  /// Destinations whose id is kept retain their counters and health. A rejected configuration
  /// leaves the previous one in place.
  pub fn on_configuration_changed(&self, config: ClusterConfig) -> Result<Arc<ClusterState>, ConfigurationError> {
    let model = self.policies.resolve(config)?;
    let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

    let id = model.config.id.clone();
    let existing = self.clusters.load().get(&id).cloned();
    let (cluster, previous) = match existing {
      Some(cluster) => {
        let previous = cluster.model();
        (cluster, Some(previous))
      }
      None => (Arc::new(ClusterState::new(id.clone())), None),
    };

    cluster.set_model(model);
    let model = cluster.model();
    cluster.apply_destination_configs(&model.config.destinations);
    cluster.update_destinations_state();

    if previous.is_none() {
      let mut clusters = HashMap::clone(&self.clusters.load());
      clusters.insert(id.clone(), cluster.clone());
      self.clusters.store(Arc::new(clusters));
      info!("cluster '{}' added", id);
    } else {
      info!("cluster '{}' updated", id);
    }

    self.update_probe_task(&cluster, &model, previous.as_deref());
    Ok(cluster)
  }

  // Restarts the probe loop only when the active check settings change.
  fn update_probe_task(&self, cluster: &Arc<ClusterState>, model: &ClusterModel, previous: Option<&ClusterModel>) {
    let mut tasks = self.probe_tasks.lock().unwrap_or_else(PoisonError::into_inner);
    let id = cluster.id();

    if model.active_health.is_none() {
      tasks.remove(id);
      return;
    }

    let unchanged = previous.map_or(false, |previous| {
      previous.config.health_check.active == model.config.health_check.active
    });
    if unchanged && tasks.contains_key(id) {
      return;
    }

    tasks.remove(id);
    if let Some(task) = self.monitor.spawn(cluster.clone()) {
      tasks.insert(id.to_string(), task);
    }
  }

  /// Applies a complete configuration: every listed cluster is applied and clusters missing from
  /// the snapshot are removed. Returns the rejected cluster configurations.
  pub fn apply_snapshot(&self, configs: Vec<ClusterConfig>) -> Vec<ConfigurationError> {
    let mut errors = Vec::new();
    let mut configured = HashSet::new();

    for config in configs {
      configured.insert(config.id.clone());
      let id = config.id.clone();
      if let Err(e) = self.on_configuration_changed(config) {
        warn!("keeping previous configuration of cluster '{}': {}", id, e);
        errors.push(e);
      }
    }

    let removed: Vec<String> = self
      .clusters
      .load()
      .keys()
      .filter(|id| !configured.contains(*id))
      .cloned()
      .collect();
    for id in removed {
      self.remove_cluster(&id);
    }
    errors
  }

  /// Removes a cluster and stops its background work. In-flight requests finish on the state they
  /// hold.
  pub fn remove_cluster(&self, id: &str) -> Option<Arc<ClusterState>> {
    let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

    let mut clusters = HashMap::clone(&self.clusters.load());
    let cluster = clusters.remove(id)?;
    self.clusters.store(Arc::new(clusters));

    self
      .probe_tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(id);
    cluster.shutdown();
    info!("cluster '{}' removed", id);
    Some(cluster)
  }

  pub fn cluster(&self, id: &str) -> Option<Arc<ClusterState>> {
    self.clusters.load().get(id).cloned()
  }

  pub fn clusters(&self) -> Arc<HashMap<String, Arc<ClusterState>>> {
    self.clusters.load_full()
  }

  pub fn get_destinations_state(&self, id: &str) -> Option<Arc<DestinationsState>> {
    self.cluster(id).map(|cluster| cluster.destinations_state())
  }

  pub fn record_outcome(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
    health::record_outcome(cluster, destination, outcome);
  }

  pub fn has_probe_task(&self, id: &str) -> bool {
    self
      .probe_tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains_key(id)
  }
}
