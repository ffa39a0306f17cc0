//! Cluster lifecycle management: the warm/swap engine (component F) and on-demand cluster
//! discovery (component G) layered on top of `agent_xds`'s subscription primitives.

pub mod callbacks;
pub mod cluster;
pub mod manager;
pub mod metrics;
pub mod on_demand;

pub use callbacks::{ClusterUpdateCallbacks, ClusterUpdateCallbacksHandle, ClusterUpdateCallbacksRegistry};
pub use cluster::{Cluster, ClusterConfig, ClusterLoadAssignmentConfig, DiscoveryType, EndpointConfig};
pub use manager::{ClusterManager, ClusterManagerHandle, ClusterSnapshot};
pub use metrics::Metrics;
pub use on_demand::{ClusterDiscoveryCallbackHandle, ClusterDiscoveryStatus, OnDemandTable};
