use crate::session_affinity::AffinityStatus;
use hyper::StatusCode;
use std::{fmt, io};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
  LoadBalancing,
  SessionAffinity,
  AffinityFailure,
  AvailableDestinations,
  ActiveHealthCheck,
  PassiveHealthCheck,
}

impl fmt::Display for PolicyKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      PolicyKind::LoadBalancing => write!(f, "load balancing"),
      PolicyKind::SessionAffinity => write!(f, "session affinity"),
      PolicyKind::AffinityFailure => write!(f, "affinity failure"),
      PolicyKind::AvailableDestinations => write!(f, "available destinations"),
      PolicyKind::ActiveHealthCheck => write!(f, "active health check"),
      PolicyKind::PassiveHealthCheck => write!(f, "passive health check"),
    }
  }
}

/// A configuration snapshot that cannot be applied. The previously applied snapshot stays active.
#[derive(Debug, Error)]
pub enum ConfigurationError {
  #[error("cluster id must not be empty")]
  EmptyClusterId,

  #[error("cluster '{cluster}': unknown {kind} policy '{name}'")]
  UnknownPolicy {
    cluster: String,
    kind: PolicyKind,
    name: String,
  },

  #[error("cluster '{cluster}': destination '{destination}' has no address")]
  MissingDestinationAddress { cluster: String, destination: String },

  #[error("cluster '{cluster}': '{name}' is not a valid affinity key name")]
  InvalidAffinityKeyName { cluster: String, name: String },

  #[error("cluster '{cluster}': active health check interval must be greater than zero")]
  ZeroProbeInterval { cluster: String },

  #[error("cluster '{cluster}': active health check timeout must be greater than zero")]
  ZeroProbeTimeout { cluster: String },

  #[error("cluster '{cluster}': request activity timeout must be greater than zero")]
  ZeroActivityTimeout { cluster: String },

  #[error("invalid data protection key: {0}")]
  InvalidProtectionKey(String),

  #[error("failed to read configuration file {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse configuration file {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: toml::de::Error,
  },
}

/// Request-scoped failure to pick a destination.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
  #[error("no available destinations")]
  NoAvailableDestinations,

  #[error("affinity key extraction failed")]
  AffinityKeyExtractionFailed,

  #[error("destination matching the affinity key was not found")]
  AffinityDestinationNotFound,
}

impl RoutingError {
  pub fn status(&self) -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
  }
}

/// Defects in the calling code, as opposed to failures caused by the request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgrammingError {
  #[error("session affinity is not enabled on cluster '{0}'")]
  AffinityDisabled(String),

  #[error("affinity failure policy invoked with non-failure status {0:?}")]
  NotAnAffinityFailure(AffinityStatus),
}

#[derive(Debug, Error)]
pub enum ForwardError {
  #[error("upstream request failed: {0}")]
  Upstream(String),

  #[error("upstream request timed out")]
  Timeout,

  #[error("request was canceled")]
  Canceled,
}

/// Failure of a single active health probe. Never leaves the health subsystem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
  #[error("invalid probe uri {0}")]
  InvalidUri(String),

  #[error("probe request failed: {0}")]
  Request(String),

  #[error("probe timed out")]
  Timeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtectError {
  #[error(transparent)]
  Encoding(#[from] base64::DecodeError),

  #[error("protected payload is truncated")]
  Truncated,

  #[error("protected payload failed authentication")]
  Authentication,

  #[error("encryption failed")]
  Encryption,

  #[error("unprotected key is not valid UTF-8")]
  InvalidKey,
}
