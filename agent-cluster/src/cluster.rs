//! Cluster and endpoint data model (§3, §4.F). Full envoy `Cluster`/`ClusterLoadAssignment`
//! protobufs are out of scope (the base spec's non-goals exclude specific load-balancing
//! policies and detailed wire parsing); these are the minimal `prost::Message` shapes the warm/
//! swap engine needs to decide when a cluster has a usable endpoint set, hand-written the way
//! `agent_xds::decode_proto` expects — no `.proto` file is required for a type that only derives
//! `prost::Message` by hand, and this keeps the crate's own configuration surface self-contained.

use agent_core::strng::Strng;

#[derive(Clone, Debug, Default, PartialEq, prost::Message)]
pub struct EndpointConfig {
	#[prost(string, tag = "1")]
	pub address: String,
	#[prost(uint32, tag = "2")]
	pub port: u32,
	#[prost(uint32, tag = "3")]
	pub weight: u32,
	#[prost(bool, tag = "4")]
	pub healthy: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, prost::Enumeration)]
#[repr(i32)]
pub enum DiscoveryType {
	#[default]
	Static = 0,
	StrictDns = 1,
	LogicalDns = 2,
	Eds = 3,
}

/// The decoded body of a "Cluster" resource. `discovery_type == Eds` means endpoints arrive
/// later on a separate "ClusterLoadAssignment" subscription keyed by `eds_service_name` (this
/// cluster's own `name` when unset); every other discovery type carries its endpoints inline.
#[derive(Clone, Debug, Default, PartialEq, prost::Message)]
pub struct ClusterConfig {
	#[prost(string, tag = "1")]
	pub name: String,
	#[prost(enumeration = "DiscoveryType", tag = "2")]
	pub discovery_type: i32,
	#[prost(string, tag = "3")]
	pub eds_service_name: String,
	#[prost(message, repeated, tag = "4")]
	pub static_endpoints: Vec<EndpointConfig>,
	#[prost(bool, tag = "5")]
	pub has_active_health_check: bool,
}

impl ClusterConfig {
	pub fn is_primary(&self) -> bool {
		self.discovery_type() != DiscoveryType::Eds
	}

	pub fn discovery_type(&self) -> DiscoveryType {
		match self.discovery_type {
			0 => DiscoveryType::Static,
			1 => DiscoveryType::StrictDns,
			2 => DiscoveryType::LogicalDns,
			_ => DiscoveryType::Eds,
		}
	}

	/// The name endpoints for this cluster are keyed under in EDS (§3: `eds_service_name` falls
	/// back to the cluster's own name when unset, matching Envoy's `ClusterLoadAssignment`
	/// addressing).
	pub fn eds_key(&self) -> Strng {
		if self.eds_service_name.is_empty() {
			Strng::from(self.name.as_str())
		} else {
			Strng::from(self.eds_service_name.as_str())
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, prost::Message)]
pub struct ClusterLoadAssignmentConfig {
	#[prost(string, tag = "1")]
	pub cluster_name: String,
	#[prost(message, repeated, tag = "2")]
	pub endpoints: Vec<EndpointConfig>,
}

/// The authoritative, fully warmed view of one cluster, as published in a [`crate::manager::ClusterSnapshot`].
#[derive(Clone, Debug)]
pub struct Cluster {
	pub name: Strng,
	pub config: ClusterConfig,
	pub endpoints: Vec<EndpointConfig>,
}

impl Cluster {
	pub fn new(config: ClusterConfig, endpoints: Vec<EndpointConfig>) -> Self {
		Cluster { name: Strng::from(config.name.as_str()), config, endpoints }
	}
}
