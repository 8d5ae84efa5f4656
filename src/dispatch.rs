use crate::{
  error::{ForwardError, ProgrammingError, RoutingError},
  error_response,
  forwarder::{ForwardOutcome, Forwarder},
  health,
  model::{ClusterModel, ClusterState, DestinationState},
  session_affinity::{failure_policy::AffinityFailureAction, AffinityResult, AffinityStatus},
};
use hyper::{Body, Request, Response};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
  /// The request could not be routed. `response` is what the client gets.
  #[error("{error}")]
  Routing {
    error: RoutingError,
    response: Response<Body>,
  },

  #[error(transparent)]
  Programming(#[from] ProgrammingError),
}

impl DispatchError {
  fn routing(error: RoutingError) -> DispatchError {
    DispatchError::Routing {
      error,
      response: error_response::routing_failure(&error),
    }
  }

  pub fn routing_error(&self) -> Option<RoutingError> {
    match self {
      DispatchError::Routing { error, .. } => Some(*error),
      DispatchError::Programming(_) => None,
    }
  }

  pub fn into_response(self) -> Response<Body> {
    match self {
      DispatchError::Routing { response, .. } => response,
      DispatchError::Programming(e) => error_response::handle_internal_server_error(e),
    }
  }
}

#[derive(Debug)]
pub struct PickedDestination {
  pub destination: Arc<DestinationState>,
  /// `None` when the cluster has no session affinity.
  pub affinity_status: Option<AffinityStatus>,
}

/// Counts a request against its destination and cluster for as long as it lives.
///
/// Dropping the lease without [`RequestLease::complete`] reports the request as canceled, so a
/// request future dropped mid-flight still releases its counters and gives passive health its one
/// observation.
#[derive(Debug)]
pub struct RequestLease {
  cluster: Arc<ClusterState>,
  destination: Arc<DestinationState>,
  completed: bool,
}

impl RequestLease {
  pub fn acquire(cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>) -> RequestLease {
    cluster.increment_requests();
    destination.increment_requests();
    RequestLease {
      cluster: cluster.clone(),
      destination: destination.clone(),
      completed: false,
    }
  }

  pub fn destination(&self) -> &Arc<DestinationState> {
    &self.destination
  }

  pub fn complete(mut self, outcome: ForwardOutcome) {
    self.completed = true;
    health::record_outcome(&self.cluster, &self.destination, outcome);
  }
}

impl Drop for RequestLease {
  fn drop(&mut self) {
    if !self.completed {
      health::record_outcome(&self.cluster, &self.destination, ForwardOutcome::Canceled);
    }
    self.destination.decrement_requests();
    self.cluster.decrement_requests();
  }
}

/// Routes requests of already resolved clusters: affinity, load balancing, forwarding and health
/// feedback.
#[derive(Debug, Clone)]
pub struct Dispatcher {
  forwarder: Arc<dyn Forwarder>,
}

impl Dispatcher {
  pub fn new(forwarder: Arc<dyn Forwarder>) -> Dispatcher {
    Dispatcher { forwarder }
  }

  /// Narrows `destinations` to the one the request is affinitized to, if any.
  pub fn narrow_by_affinity(
    &self,
    request: &Request<Body>,
    cluster: &ClusterState,
    destinations: &[Arc<DestinationState>],
  ) -> Result<AffinityResult, ProgrammingError> {
    let model = cluster.model();
    let affinity = model
      .session_affinity
      .as_ref()
      .ok_or_else(|| ProgrammingError::AffinityDisabled(cluster.id().to_string()))?;
    affinity
      .policy
      .find_affinitized_destinations(request, cluster, &affinity.config, destinations)
  }

  pub fn pick_destination(&self, request: &Request<Body>, cluster: &ClusterState) -> Result<PickedDestination, DispatchError> {
    self.pick(request, cluster, &cluster.model())
  }

  fn pick(&self, request: &Request<Body>, cluster: &ClusterState, model: &ClusterModel) -> Result<PickedDestination, DispatchError> {
    let state = cluster.destinations_state();
    let mut affinity_status = None;
    let mut narrowed = None;

    if let Some(affinity) = &model.session_affinity {
      let result = affinity
        .policy
        .find_affinitized_destinations(request, cluster, &affinity.config, &state.available)?;
      affinity_status = Some(result.status);

      match result.status.routing_error() {
        Some(error) => match affinity.failure_policy.handle(cluster, result.status)? {
          AffinityFailureAction::ContinueRouting => {}
          AffinityFailureAction::Respond(response) => return Err(DispatchError::Routing { error, response }),
        },
        None => narrowed = Some(result.destinations),
      }
    }

    let candidates = narrowed.as_deref().unwrap_or(&state.available);
    let destination = match candidates {
      [] => None,
      [single] => Some(single.clone()),
      _ => model.load_balancing.pick_destination(request, cluster, candidates),
    };

    match destination {
      Some(destination) => {
        debug!("cluster '{}': picked destination '{}'", cluster.id(), destination.id());
        Ok(PickedDestination {
          destination,
          affinity_status,
        })
      }
      None => {
        warn!("cluster '{}': no available destinations", cluster.id());
        Err(DispatchError::routing(RoutingError::NoAvailableDestinations))
      }
    }
  }

  pub fn record_outcome(&self, cluster: &Arc<ClusterState>, destination: &Arc<DestinationState>, outcome: ForwardOutcome) {
    health::record_outcome(cluster, destination, outcome);
  }

  /// Runs the whole pipeline for one request. Never fails: routing failures become 503 responses and
  /// forwarding failures become 502 (504 on timeout).
  pub async fn dispatch(&self, request: Request<Body>, cluster: &Arc<ClusterState>) -> Response<Body> {
    let model = cluster.model();
    let picked = match self.pick(&request, cluster, &model) {
      Ok(picked) => picked,
      Err(e) => return e.into_response(),
    };

    let address = picked.destination.config().address.clone();
    let lease = RequestLease::acquire(cluster, &picked.destination);
    let result = self
      .forwarder
      .forward(request, &address, model.config.http_request.activity_timeout())
      .await;
    lease.complete(ForwardOutcome::of(&result));

    let mut response = match result {
      Ok(response) => response,
      Err(ForwardError::Timeout) => {
        warn!(
          "cluster '{}': destination '{}' timed out",
          cluster.id(),
          picked.destination.id()
        );
        return error_response::gateway_timeout();
      }
      Err(e) => return error_response::handle_bad_gateway(e),
    };

    if let (Some(affinity), Some(status)) = (&model.session_affinity, picked.affinity_status) {
      if let Err(e) = affinity.policy.affinitize_response(
        &mut response,
        status,
        cluster,
        &affinity.config,
        &picked.destination,
      ) {
        return error_response::handle_internal_server_error(e);
      }
    }
    response
  }
}
