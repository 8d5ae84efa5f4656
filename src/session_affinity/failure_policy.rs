use super::AffinityStatus;
use crate::{
  error::{PolicyKind, ProgrammingError},
  error_response,
  model::ClusterState,
  policy::{NamedPolicy, PolicyRegistry},
};
use hyper::{Body, Response};
use log::debug;
use std::{fmt::Debug, sync::Arc};

pub const REDISTRIBUTE: &str = "Redistribute";
pub const RETURN_503_ERROR: &str = "Return503Error";

#[derive(Debug)]
pub enum AffinityFailureAction {
  /// Route the request over all available destinations as if it had no key.
  ContinueRouting,
  /// Stop routing and send this response.
  Respond(Response<Body>),
}

impl AffinityFailureAction {
  pub fn continue_routing(&self) -> bool {
    matches!(self, AffinityFailureAction::ContinueRouting)
  }
}

/// Decides what happens to a request whose affinity key could not be honoured.
///
/// Only `DestinationNotFound` and `AffinityKeyExtractionFailed` are failures; any other status
/// yields a [`ProgrammingError`].
pub trait AffinityFailurePolicy: NamedPolicy + Debug + Send + Sync {
  fn handle(&self, cluster: &ClusterState, status: AffinityStatus) -> Result<AffinityFailureAction, ProgrammingError>;
}

fn ensure_failure(status: AffinityStatus) -> Result<(), ProgrammingError> {
  if status.is_failure() {
    Ok(())
  } else {
    Err(ProgrammingError::NotAnAffinityFailure(status))
  }
}

#[derive(Debug, Default)]
pub struct Redistribute;

impl NamedPolicy for Redistribute {
  fn name(&self) -> &'static str {
    REDISTRIBUTE
  }
}

impl AffinityFailurePolicy for Redistribute {
  fn handle(&self, cluster: &ClusterState, status: AffinityStatus) -> Result<AffinityFailureAction, ProgrammingError> {
    ensure_failure(status)?;
    debug!("cluster '{}': affinity failed with {:?}, redistributing", cluster.id(), status);
    Ok(AffinityFailureAction::ContinueRouting)
  }
}

#[derive(Debug, Default)]
pub struct Return503Error;

impl NamedPolicy for Return503Error {
  fn name(&self) -> &'static str {
    RETURN_503_ERROR
  }
}

impl AffinityFailurePolicy for Return503Error {
  fn handle(&self, _cluster: &ClusterState, status: AffinityStatus) -> Result<AffinityFailureAction, ProgrammingError> {
    ensure_failure(status)?;
    Ok(AffinityFailureAction::Respond(error_response::service_unavailable()))
  }
}

pub fn builtin_failure_policies() -> PolicyRegistry<dyn AffinityFailurePolicy> {
  let mut registry: PolicyRegistry<dyn AffinityFailurePolicy> =
    PolicyRegistry::new(PolicyKind::AffinityFailure, REDISTRIBUTE);
  registry
    .register(Arc::new(Redistribute))
    .register(Arc::new(Return503Error));
  registry
}
