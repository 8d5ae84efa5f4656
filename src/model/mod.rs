pub mod cluster;
pub mod destination;

pub use cluster::{ClusterModel, ClusterState, DestinationsDiff, DestinationsState, ResolvedAffinity};
pub use destination::{ActiveHealth, DestinationHealth, DestinationState, PassiveHealth};
