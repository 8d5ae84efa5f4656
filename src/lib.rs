//! Request-routing core of the load balancer: cluster and destination state,
//! load-balancing policies, session affinity, health checks and per-request dispatch.

pub mod clock;
pub mod configuration;
pub mod dispatch;
pub mod error;
pub mod error_response;
pub mod forwarder;
pub mod health;
pub mod load_balancing;
pub mod logging;
pub mod model;
pub mod policy;
pub mod random;
pub mod registry;
pub mod server;
pub mod session_affinity;

pub use dispatch::{DispatchError, Dispatcher, PickedDestination, RequestLease};
pub use error::{ConfigurationError, ForwardError, ProgrammingError, ProtectError, RoutingError};
pub use forwarder::{ForwardOutcome, Forwarder};
pub use model::{ClusterModel, ClusterState, DestinationState, DestinationsState};
pub use registry::{ClusterRegistry, Policies};
