//! Generated protobuf types plus small convenience wrappers around them.

pub mod envoy {
	pub mod config {
		pub mod core {
			pub mod v3 {
				tonic::include_proto!("envoy.config.core.v3");
			}
		}
	}
	pub mod service {
		pub mod discovery {
			pub mod v3 {
				tonic::include_proto!("envoy.service.discovery.v3");
			}
		}
	}
}

pub use envoy::config::core::v3::Node;
pub use envoy::service::discovery::v3::{
	ControlPlane, DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
	Resource, Status, aggregated_discovery_service_client::AggregatedDiscoveryServiceClient,
	aggregated_discovery_service_server::{AggregatedDiscoveryService, AggregatedDiscoveryServiceServer},
};

use agent_core::strng::Strng;

/// Identity of a resource inside one subscription: `(type_url, name)`.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ResourceKey {
	pub name: Strng,
	pub type_url: Strng,
}

impl std::fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.type_url, self.name)
	}
}

/// A decoded resource update as delivered to a [`crate::watch_map::WatchMap`].
#[derive(Clone, Debug)]
pub struct XdsResource<T> {
	pub name: Strng,
	pub version: Strng,
	pub resource: T,
}

/// One item of a delta response: either an add/modify or a removal by name.
#[derive(Clone, Debug)]
pub enum XdsUpdate<T> {
	Update(XdsResource<T>),
	Remove(Strng),
}

pub fn decode_proto<T: prost::Message + Default>(value: &[u8]) -> Result<T, prost::DecodeError> {
	T::decode(value)
}
