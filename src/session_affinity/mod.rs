use crate::{
  configuration::SessionAffinityConfig,
  error::{PolicyKind, ProgrammingError, ProtectError, RoutingError},
  model::{ClusterState, DestinationState},
  policy::{NamedPolicy, PolicyRegistry},
};
use base64::{
  alphabet,
  engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
  Engine,
};
use hyper::{Body, Request, Response};
use log::{error, warn};
use std::{fmt::Debug, sync::Arc};

pub mod cookie;
pub mod custom_header;
pub mod failure_policy;
pub mod protector;

use self::protector::DataProtector;

pub const COOKIE: &str = "Cookie";
pub const CUSTOM_HEADER: &str = "CustomHeader";

// Standard alphabet, unpadded on the way out, accepts either form on the way in
const KEY_ENCODING: GeneralPurpose = GeneralPurpose::new(
  &alphabet::STANDARD,
  GeneralPurposeConfig::new()
    .with_encode_padding(false)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityStatus {
  Ok,
  AffinityKeyNotSet,
  DestinationNotFound,
  AffinityKeyExtractionFailed,
}

impl AffinityStatus {
  /// Statuses the failure policy has to decide about.
  pub fn is_failure(self) -> bool {
    matches!(
      self,
      AffinityStatus::DestinationNotFound | AffinityStatus::AffinityKeyExtractionFailed
    )
  }

  pub fn routing_error(self) -> Option<RoutingError> {
    match self {
      AffinityStatus::DestinationNotFound => Some(RoutingError::AffinityDestinationNotFound),
      AffinityStatus::AffinityKeyExtractionFailed => Some(RoutingError::AffinityKeyExtractionFailed),
      AffinityStatus::Ok | AffinityStatus::AffinityKeyNotSet => None,
    }
  }
}

/// Outcome of affinity narrowing.
///
/// `destinations` holds the matching destination for `Ok`, the unchanged candidates for
/// `AffinityKeyNotSet` and nothing for the failure statuses.
#[derive(Debug)]
pub struct AffinityResult {
  pub status: AffinityStatus,
  pub destinations: Vec<Arc<DestinationState>>,
}

impl AffinityResult {
  fn failed(status: AffinityStatus) -> AffinityResult {
    AffinityResult {
      status,
      destinations: Vec::new(),
    }
  }
}

/// Turns affinity keys into the opaque values handed to clients and back.
#[derive(Debug, Clone)]
pub struct KeyProtection {
  protector: Arc<dyn DataProtector>,
}

impl KeyProtection {
  pub fn new(protector: Arc<dyn DataProtector>) -> KeyProtection {
    KeyProtection { protector }
  }

  pub fn protect(&self, key: &str) -> Result<String, ProtectError> {
    let protected = self.protector.protect(key.as_bytes())?;
    Ok(KEY_ENCODING.encode(protected))
  }

  pub fn unprotect(&self, encoded: &str) -> Result<String, ProtectError> {
    let protected = KEY_ENCODING.decode(encoded)?;
    let key = self.protector.unprotect(&protected)?;
    String::from_utf8(key).map_err(|_| ProtectError::InvalidKey)
  }
}

/// Binds clients to destinations through an encrypted key carried by the request.
///
/// Implementations only decide where the key travels; lookup, encryption and logging are shared
/// through the provided methods.
pub trait SessionAffinityPolicy: NamedPolicy + Debug + Send + Sync {
  fn protection(&self) -> &KeyProtection;

  /// The still protected key the request carries, if any.
  fn read_protected_key(&self, request: &Request<Body>, config: &SessionAffinityConfig) -> Option<String>;

  fn write_protected_key(&self, response: &mut Response<Body>, config: &SessionAffinityConfig, protected_key: &str);

  fn destination_affinity_key(&self, destination: &DestinationState) -> String {
    destination.id().to_string()
  }

  fn find_affinitized_destinations(
    &self,
    request: &Request<Body>,
    cluster: &ClusterState,
    config: &SessionAffinityConfig,
    destinations: &[Arc<DestinationState>],
  ) -> Result<AffinityResult, ProgrammingError> {
    if !config.enabled {
      return Err(ProgrammingError::AffinityDisabled(cluster.id().to_string()));
    }

    let protected_key = match self.read_protected_key(request, config) {
      Some(key) if !key.is_empty() => key,
      _ => {
        return Ok(AffinityResult {
          status: AffinityStatus::AffinityKeyNotSet,
          destinations: destinations.to_vec(),
        })
      }
    };

    let key = match self.protection().unprotect(&protected_key) {
      Ok(key) => key,
      Err(e) => {
        error!(
          "cluster '{}': unable to unprotect the affinity key {}: {}",
          cluster.id(),
          config.affinity_key_name,
          e
        );
        return Ok(AffinityResult::failed(AffinityStatus::AffinityKeyExtractionFailed));
      }
    };

    if destinations.is_empty() {
      warn!(
        "cluster '{}': affinity cannot be established because no destinations are available",
        cluster.id()
      );
      return Ok(AffinityResult::failed(AffinityStatus::DestinationNotFound));
    }

    match destinations
      .iter()
      .find(|destination| self.destination_affinity_key(destination) == key)
    {
      Some(destination) => Ok(AffinityResult {
        status: AffinityStatus::Ok,
        destinations: vec![destination.clone()],
      }),
      None => {
        warn!(
          "cluster '{}': destination matching affinity key '{}' was not found",
          cluster.id(),
          key
        );
        Ok(AffinityResult::failed(AffinityStatus::DestinationNotFound))
      }
    }
  }

  /// Attaches the protected key of `destination` unless the request was already affinitized to it.
  fn affinitize_response(
    &self,
    response: &mut Response<Body>,
    status: AffinityStatus,
    cluster: &ClusterState,
    config: &SessionAffinityConfig,
    destination: &DestinationState,
  ) -> Result<(), ProgrammingError> {
    if !config.enabled {
      return Err(ProgrammingError::AffinityDisabled(cluster.id().to_string()));
    }
    if status == AffinityStatus::Ok {
      return Ok(());
    }

    match self.protection().protect(&self.destination_affinity_key(destination)) {
      Ok(protected_key) => self.write_protected_key(response, config, &protected_key),
      Err(e) => error!(
        "cluster '{}': unable to protect the affinity key of destination '{}': {}",
        cluster.id(),
        destination.id(),
        e
      ),
    }
    Ok(())
  }
}

pub fn builtin_policies(protector: Arc<dyn DataProtector>) -> PolicyRegistry<dyn SessionAffinityPolicy> {
  let protection = KeyProtection::new(protector);
  let mut registry: PolicyRegistry<dyn SessionAffinityPolicy> = PolicyRegistry::new(PolicyKind::SessionAffinity, COOKIE);
  registry
    .register(Arc::new(cookie::CookieSessionAffinity::new(protection.clone())))
    .register(Arc::new(custom_header::CustomHeaderSessionAffinity::new(protection)));
  registry
}
