use crate::{
  clock::Clock,
  configuration::ActiveHealthCheckConfig,
  error::{PolicyKind, ProbeError},
  model::{ActiveHealth, ClusterState, DestinationState},
  policy::{NamedPolicy, PolicyRegistry},
};
use async_trait::async_trait;
use futures::{future::join_all, FutureExt};
use hyper::StatusCode;
use log::{debug, error, info};
use std::{
  fmt::Debug,
  panic::AssertUnwindSafe,
  sync::{atomic::Ordering, Arc},
};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub const CONSECUTIVE_FAILURES: &str = "ConsecutiveFailures";
pub const CONSECUTIVE_FAILURES_THRESHOLD: &str = "ConsecutiveFailuresHealthPolicy.Threshold";
const DEFAULT_THRESHOLD: u32 = 2;

#[derive(Debug)]
pub struct ProbeResult {
  pub destination: Arc<DestinationState>,
  pub outcome: Result<StatusCode, ProbeError>,
}

/// Sends one out-of-band health request to a destination.
#[async_trait]
pub trait HealthProber: Debug + Send + Sync {
  async fn probe(
    &self,
    destination: &DestinationState,
    config: &ActiveHealthCheckConfig,
  ) -> Result<StatusCode, ProbeError>;
}

/// Turns a batch of probe results into active health.
pub trait ActiveHealthCheckPolicy: NamedPolicy + Debug + Send + Sync {
  /// Updates the active axis of every probed destination. Returns true when any of them changed.
  fn probing_completed(&self, cluster: &ClusterState, results: &[ProbeResult]) -> bool;
}

/// A destination turns unhealthy after `ConsecutiveFailuresHealthPolicy.Threshold` failed probes
/// in a row and healthy again on the first probe answered with a 2xx status.
#[derive(Debug, Default)]
pub struct ConsecutiveFailures;

impl NamedPolicy for ConsecutiveFailures {
  fn name(&self) -> &'static str {
    CONSECUTIVE_FAILURES
  }
}

impl ActiveHealthCheckPolicy for ConsecutiveFailures {
  fn probing_completed(&self, cluster: &ClusterState, results: &[ProbeResult]) -> bool {
    let threshold = cluster
      .model()
      .config
      .metadata_value(CONSECUTIVE_FAILURES_THRESHOLD, DEFAULT_THRESHOLD);
    let mut changed = false;

    for result in results {
      let health = &result.destination.health;
      let failures = match &result.outcome {
        Ok(status) if status.is_success() => {
          health.consecutive_probe_failures.store(0, Ordering::Release);
          0
        }
        outcome => {
          debug!(
            "cluster '{}': probe of destination '{}' failed: {:?}",
            cluster.id(),
            result.destination.id(),
            outcome
          );
          health.consecutive_probe_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
        }
      };

      let new_health = if failures >= threshold {
        ActiveHealth::Unhealthy
      } else {
        ActiveHealth::Healthy
      };
      let previous = health.set_active(new_health);
      if previous != new_health {
        info!(
          "cluster '{}': active health of destination '{}' changed from {} to {}",
          cluster.id(),
          result.destination.id(),
          previous,
          new_health
        );
        changed = true;
      }
    }
    changed
  }
}

pub fn builtin_policies() -> PolicyRegistry<dyn ActiveHealthCheckPolicy> {
  let mut registry: PolicyRegistry<dyn ActiveHealthCheckPolicy> =
    PolicyRegistry::new(PolicyKind::ActiveHealthCheck, CONSECUTIVE_FAILURES);
  registry.register(Arc::new(ConsecutiveFailures));
  registry
}

/// Handle of a running probe loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct ProbeTask {
  token: CancellationToken,
  handle: JoinHandle<()>,
}

impl ProbeTask {
  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Cancels the loop and waits until it has exited.
  pub async fn stopped(mut self) {
    self.token.cancel();
    if let Err(e) = (&mut self.handle).await {
      error!("active health check task failed: {}", e);
    }
  }
}

impl Drop for ProbeTask {
  fn drop(&mut self) {
    self.token.cancel();
  }
}

/// Periodically probes every destination of a cluster and applies its active health policy.
#[derive(Debug, Clone)]
pub struct ActiveHealthCheckMonitor {
  prober: Arc<dyn HealthProber>,
  clock: Arc<dyn Clock>,
}

impl ActiveHealthCheckMonitor {
  pub fn new(prober: Arc<dyn HealthProber>, clock: Arc<dyn Clock>) -> ActiveHealthCheckMonitor {
    ActiveHealthCheckMonitor { prober, clock }
  }

  /// Probes all destinations once, concurrently, and republishes the cluster's destinations state
  /// when the policy changed any of them.
  pub async fn check_health_once(&self, cluster: &ClusterState) {
    let model = cluster.model();
    let policy = match &model.active_health {
      Some(policy) => policy.clone(),
      None => return,
    };
    let config = &model.config.health_check.active;

    let destinations = cluster.destinations();
    let probes = destinations.values().cloned().map(|destination| async move {
      let outcome = self.prober.probe(&destination, config).await;
      ProbeResult { destination, outcome }
    });
    let results = join_all(probes).await;

    if policy.probing_completed(cluster, &results) {
      cluster.update_destinations_state();
    }
  }

  /// Starts the probe loop of `cluster` on the current tokio runtime.
  ///
  /// The loop stops when the returned task is dropped or when the cluster shuts down. Returns
  /// `None` outside a runtime.
  pub fn spawn(&self, cluster: Arc<ClusterState>) -> Option<ProbeTask> {
    let runtime = match Handle::try_current() {
      Ok(runtime) => runtime,
      Err(_) => {
        error!(
          "cluster '{}': no async runtime, active health checks are not running",
          cluster.id()
        );
        return None;
      }
    };
    let token = cluster.shutdown_token().child_token();
    let handle = runtime.spawn(self.clone().run(cluster, token.clone()));
    Some(ProbeTask { token, handle })
  }

  async fn run(self, cluster: Arc<ClusterState>, token: CancellationToken) {
    info!("cluster '{}': starting active health checks", cluster.id());
    loop {
      let tick = AssertUnwindSafe(self.check_health_once(&cluster)).catch_unwind();
      tokio::select! {
        _ = token.cancelled() => break,
        result = tick => {
          if result.is_err() {
            error!("cluster '{}': active health check failed, retrying on next interval", cluster.id());
          }
        }
      }

      let interval = cluster.model().config.health_check.active.interval();
      let wake_up = self.clock.sleep_until(self.clock.now() + interval);
      tokio::select! {
        _ = token.cancelled() => break,
        _ = wake_up => {}
      }
    }
    info!("cluster '{}': stopped active health checks", cluster.id());
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use super::*;
  use std::{
    collections::HashMap,
    sync::{atomic::AtomicUsize, Mutex},
  };

  /// Answers probes from a per-destination table and counts them.
  #[derive(Debug, Default)]
  pub struct ScriptedProber {
    answers: Mutex<HashMap<String, Result<StatusCode, ProbeError>>>,
    pub probes: AtomicUsize,
  }

  impl ScriptedProber {
    pub fn answer(&self, destination: &str, outcome: Result<StatusCode, ProbeError>) {
      self.answers.lock().unwrap().insert(destination.to_string(), outcome);
    }

    pub fn probes(&self) -> usize {
      self.probes.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl HealthProber for ScriptedProber {
    async fn probe(
      &self,
      destination: &DestinationState,
      _config: &ActiveHealthCheckConfig,
    ) -> Result<StatusCode, ProbeError> {
      self.probes.fetch_add(1, Ordering::SeqCst);
      self
        .answers
        .lock()
        .unwrap()
        .get(destination.id())
        .cloned()
        .unwrap_or(Ok(StatusCode::OK))
    }
  }
}
