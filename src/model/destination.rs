use crate::{configuration::DestinationConfig, health::passive::FailureWindow};
use arc_swap::ArcSwap;
use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc, Mutex,
  },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveHealth {
  Unknown,
  Healthy,
  Unhealthy,
}

impl ActiveHealth {
  fn from_u8(value: u8) -> ActiveHealth {
    match value {
      1 => ActiveHealth::Healthy,
      2 => ActiveHealth::Unhealthy,
      _ => ActiveHealth::Unknown,
    }
  }

  fn as_u8(self) -> u8 {
    match self {
      ActiveHealth::Unknown => 0,
      ActiveHealth::Healthy => 1,
      ActiveHealth::Unhealthy => 2,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveHealth {
  Healthy,
  Unhealthy,
}

impl fmt::Display for ActiveHealth {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

impl fmt::Display for PassiveHealth {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Health of a destination along two independent axes. Each setter returns the previous value so
/// callers can tell whether they caused a transition.
#[derive(Debug, Default)]
pub struct DestinationHealth {
  active: AtomicU8,
  passive_unhealthy: AtomicBool,
  reactivation_generation: AtomicU64,
  pub(crate) consecutive_probe_failures: AtomicU32,
  pub(crate) failure_window: Mutex<FailureWindow>,
}

impl DestinationHealth {
  pub fn active(&self) -> ActiveHealth {
    ActiveHealth::from_u8(self.active.load(Ordering::Acquire))
  }

  pub fn set_active(&self, health: ActiveHealth) -> ActiveHealth {
    ActiveHealth::from_u8(self.active.swap(health.as_u8(), Ordering::AcqRel))
  }

  pub fn passive(&self) -> PassiveHealth {
    if self.passive_unhealthy.load(Ordering::Acquire) {
      PassiveHealth::Unhealthy
    } else {
      PassiveHealth::Healthy
    }
  }

  pub fn set_passive(&self, health: PassiveHealth) -> PassiveHealth {
    let was_unhealthy = self
      .passive_unhealthy
      .swap(health == PassiveHealth::Unhealthy, Ordering::AcqRel);
    if was_unhealthy {
      PassiveHealth::Unhealthy
    } else {
      PassiveHealth::Healthy
    }
  }

  /// Starts a new reactivation period and returns its generation. Periods scheduled earlier become
  /// stale.
  pub(crate) fn next_reactivation(&self) -> u64 {
    self.reactivation_generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
  }

  pub(crate) fn is_current_reactivation(&self, generation: u64) -> bool {
    self.reactivation_generation.load(Ordering::Acquire) == generation
  }
}

/// Live state of one backend endpoint.
///
/// The record outlives configuration reloads as long as its id stays configured, so in-flight
/// counters and health survive a reload. Requests hold an `Arc` to it, which keeps a removed
/// destination alive until they complete.
#[derive(Debug)]
pub struct DestinationState {
  id: String,
  model: ArcSwap<DestinationConfig>,
  concurrent_requests: AtomicUsize,
  pub health: DestinationHealth,
}

impl DestinationState {
  pub fn new(id: impl Into<String>) -> DestinationState {
    DestinationState::with_config(id, DestinationConfig::default())
  }

  pub fn with_config(id: impl Into<String>, config: DestinationConfig) -> DestinationState {
    DestinationState {
      id: id.into(),
      model: ArcSwap::from_pointee(config),
      concurrent_requests: AtomicUsize::new(0),
      health: DestinationHealth::default(),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn config(&self) -> Arc<DestinationConfig> {
    self.model.load_full()
  }

  /// Swaps in a new configuration snapshot. Returns false when it equals the current one.
  pub(crate) fn replace_config(&self, config: &DestinationConfig) -> bool {
    if self.model.load().as_ref() == config {
      return false;
    }
    self.model.store(Arc::new(config.clone()));
    true
  }

  pub fn concurrent_requests(&self) -> usize {
    self.concurrent_requests.load(Ordering::Relaxed)
  }

  pub fn increment_requests(&self) {
    self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
  }

  /// Never goes below zero.
  pub fn decrement_requests(&self) {
    let _ = self
      .concurrent_requests
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| count.checked_sub(1));
  }
}
