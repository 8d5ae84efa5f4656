use crate::{
  error::ConfigurationError,
  registry::ClusterRegistry,
  session_affinity::protector::AesGcmProtector,
};
use log::{error, info, warn};
use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::{
  collections::{BTreeMap, HashMap},
  fs,
  net::SocketAddr,
  sync::{mpsc::channel, Arc},
  time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

pub struct ConfigWatcher {
  toml_path: String,
}

impl ConfigWatcher {
  pub fn new(toml_path: String) -> ConfigWatcher {
    ConfigWatcher { toml_path }
  }

  fn start_config_watcher(toml_path: &str, cs: UnboundedSender<Config>) -> notify::Result<RecommendedWatcher> {
    let toml_path = toml_path.to_string();
    let (tx, rx) = channel();
    let mut watcher = watcher(tx, Duration::from_secs(2))?;
    watcher.watch(&toml_path, RecursiveMode::NonRecursive)?;

    std::thread::spawn(move || loop {
      let config = match rx.recv() {
        Ok(DebouncedEvent::NoticeWrite(_)) | Ok(DebouncedEvent::Write(_)) => Config::load(&toml_path),
        Ok(_) => continue,
        Err(_) => return,
      };

      match config {
        Ok(config) => {
          if let Err(e) = cs.send(config) {
            error!("Error occurred when sending config from config watcher thread: {:?}", e);
            return;
          }
        }
        Err(e) => warn!("{}", e),
      }
    });
    Ok(watcher)
  }

  /// Re-applies the configuration file to `registry` every time it changes on disk.
  pub async fn watch_config_and_apply(&self, registry: Arc<ClusterRegistry>) -> notify::Result<()> {
    let (cs, mut cr) = unbounded_channel();
    // dropping this would stop the config watcher
    let _watcher = ConfigWatcher::start_config_watcher(&self.toml_path, cs)?;

    while let Some(config) = cr.recv().await {
      info!("Configuration file {} changed, applying", self.toml_path);
      let rejected = registry.apply_snapshot(config.clusters);
      if !rejected.is_empty() {
        warn!("{} cluster configuration(s) rejected, previous versions stay active", rejected.len());
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
  #[serde(default = "default_listen_address")]
  pub listen_address: SocketAddr,
  #[serde(default)]
  pub data_protection: DataProtectionConfig,
  #[serde(default)]
  pub clusters: Vec<ClusterConfig>,
}

fn default_listen_address() -> SocketAddr {
  SocketAddr::from(([0, 0, 0, 0], 80))
}

impl Config {
  pub fn load(toml_path: &str) -> Result<Config, ConfigurationError> {
    let toml_str = fs::read_to_string(toml_path).map_err(|source| ConfigurationError::Read {
      path: toml_path.to_string(),
      source,
    })?;
    let config = Config::parse(toml_path, &toml_str)?;
    info!("Successfully parsed configuration!");
    config.print_warnings();
    Ok(config)
  }

  pub fn parse(toml_path: &str, toml_str: &str) -> Result<Config, ConfigurationError> {
    toml::from_str(toml_str).map_err(|source| ConfigurationError::Parse {
      path: toml_path.to_string(),
      source,
    })
  }

  fn print_warnings(&self) {
    for cluster in &self.clusters {
      if cluster.hosts.is_empty() {
        warn!("cluster '{}' is unreachable, since no hosts are registered.", cluster.id);
      }

      if cluster.destinations.is_empty() {
        warn!(
          "cluster '{}' does not contain any destinations. It will always result in service unavailable errors.",
          cluster.id
        );
      }
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DataProtectionConfig {
  /// Base64 encoded 256 bit key. A random key is generated when absent, which invalidates
  /// affinity keys handed out before a restart.
  pub key: Option<String>,
}

impl DataProtectionConfig {
  pub fn protector(&self) -> Result<AesGcmProtector, ConfigurationError> {
    match &self.key {
      Some(key) => AesGcmProtector::from_base64(key),
      None => {
        warn!("No data protection key configured, generating a random one");
        Ok(AesGcmProtector::generate())
      }
    }
  }
}

/// Everything known about one cluster. Applying a new `ClusterConfig` replaces the previous one
/// for the same id as a whole.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ClusterConfig {
  pub id: String,
  #[serde(default)]
  pub hosts: Vec<String>,
  #[serde(default)]
  pub load_balancing_policy: Option<String>,
  #[serde(default)]
  pub session_affinity: Option<SessionAffinityConfig>,
  #[serde(default)]
  pub health_check: HealthCheckConfig,
  #[serde(default)]
  pub http_request: ForwarderRequestConfig,
  #[serde(default)]
  pub destinations: BTreeMap<String, DestinationConfig>,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

impl ClusterConfig {
  pub fn new(id: impl Into<String>) -> ClusterConfig {
    ClusterConfig {
      id: id.into(),
      ..ClusterConfig::default()
    }
  }

  pub fn with_destination(mut self, id: impl Into<String>, address: impl Into<String>) -> ClusterConfig {
    self.destinations.insert(
      id.into(),
      DestinationConfig {
        address: address.into(),
        ..DestinationConfig::default()
      },
    );
    self
  }

  /// Parses a metadata entry, falling back to `default` when it is absent or malformed.
  pub fn metadata_value<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
    match self.metadata.get(key) {
      Some(value) => value.parse().unwrap_or_else(|_| {
        warn!("cluster '{}': ignoring invalid metadata value {}={}", self.id, key, value);
        default
      }),
      None => default,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DestinationConfig {
  pub address: String,
  /// Address used for active health probes instead of `address`.
  #[serde(default)]
  pub health: Option<String>,
  #[serde(default)]
  pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
  #[serde(default)]
  pub active: ActiveHealthCheckConfig,
  #[serde(default)]
  pub passive: PassiveHealthCheckConfig,
  #[serde(default)]
  pub available_destinations_policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActiveHealthCheckConfig {
  pub enabled: bool,
  pub interval_ms: u64,
  pub timeout_ms: u64,
  pub policy: Option<String>,
  pub path: Option<String>,
}

impl Default for ActiveHealthCheckConfig {
  fn default() -> Self {
    ActiveHealthCheckConfig {
      enabled: false,
      interval_ms: 15_000,
      timeout_ms: 10_000,
      policy: None,
      path: None,
    }
  }
}

impl ActiveHealthCheckConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PassiveHealthCheckConfig {
  pub enabled: bool,
  pub policy: Option<String>,
  pub reactivation_period_ms: u64,
}

impl Default for PassiveHealthCheckConfig {
  fn default() -> Self {
    PassiveHealthCheckConfig {
      enabled: false,
      policy: None,
      reactivation_period_ms: 60_000,
    }
  }
}

impl PassiveHealthCheckConfig {
  pub fn reactivation_period(&self) -> Duration {
    Duration::from_millis(self.reactivation_period_ms)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForwarderRequestConfig {
  pub activity_timeout_ms: u64,
}

impl Default for ForwarderRequestConfig {
  fn default() -> Self {
    ForwarderRequestConfig {
      activity_timeout_ms: 100_000,
    }
  }
}

impl ForwarderRequestConfig {
  pub fn activity_timeout(&self) -> Duration {
    Duration::from_millis(self.activity_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SessionAffinityConfig {
  #[serde(default)]
  pub enabled: bool,
  #[serde(default)]
  pub policy: Option<String>,
  #[serde(default)]
  pub failure_policy: Option<String>,
  pub affinity_key_name: String,
  #[serde(default)]
  pub cookie: SessionAffinityCookieConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionAffinityCookieConfig {
  pub path: Option<String>,
  pub domain: Option<String>,
  pub http_only: bool,
  pub secure: bool,
  pub same_site: Option<CookieSameSite>,
  pub max_age_ms: Option<u64>,
}

impl Default for SessionAffinityCookieConfig {
  fn default() -> Self {
    SessionAffinityCookieConfig {
      path: Some("/".into()),
      domain: None,
      http_only: true,
      secure: false,
      same_site: None,
      max_age_ms: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum CookieSameSite {
  Strict,
  Lax,
  None,
}

impl From<CookieSameSite> for cookie::SameSite {
  fn from(other: CookieSameSite) -> Self {
    match other {
      CookieSameSite::Strict => cookie::SameSite::Strict,
      CookieSameSite::Lax => cookie::SameSite::Lax,
      CookieSameSite::None => cookie::SameSite::None,
    }
  }
}
