// Adapted from `crates/xds/src/metrics.rs`.

use agent_core::strng::Strng;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TypeUrl {
	pub type_url: Strng,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ConnectionTerminationReason {
	ConnectionError,
	Error,
	Reconnect,
	Complete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnectionTermination {
	pub reason: ConnectionTerminationReason,
}

/// Per control-plane and per-subscription gauges/counters named in the observability surface.
pub struct Metrics {
	pub connection_terminations: Family<ConnectionTermination, Counter>,
	pub message_types: Family<TypeUrl, Counter>,
	pub total_messages_size: Family<TypeUrl, Counter>,
	pub rate_limit_enforced: Counter,
	pub connected_state: Gauge,
	pub pending_requests: Gauge,
	pub update_rejected: Family<TypeUrl, Counter>,
	pub update_success: Family<TypeUrl, Counter>,
	pub update_attempt: Family<TypeUrl, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let connection_terminations = Family::default();
		registry.register(
			"xds_connection_terminations",
			"Number of xDS stream terminations",
			connection_terminations.clone(),
		);

		let message_types = Family::default();
		registry.register(
			"xds_message",
			"Number of xDS messages received",
			message_types.clone(),
		);

		let total_messages_size = Family::default();
		registry.register_with_unit(
			"xds_message",
			"Total size of xDS messages received",
			Unit::Bytes,
			total_messages_size.clone(),
		);

		let rate_limit_enforced = Counter::default();
		registry.register(
			"rate_limit_enforced",
			"Number of times the xDS stream's rate limit delayed a request",
			rate_limit_enforced.clone(),
		);

		let connected_state = Gauge::default();
		registry.register(
			"connected_state",
			"Whether the xDS stream is currently connected",
			connected_state.clone(),
		);

		let pending_requests = Gauge::default();
		registry.register(
			"pending_requests",
			"Number of discovery requests queued but not yet sent",
			pending_requests.clone(),
		);

		let update_rejected = Family::default();
		registry.register(
			"update_rejected",
			"Number of rejected (NACKed) updates per type_url",
			update_rejected.clone(),
		);
		let update_success = Family::default();
		registry.register(
			"update_success",
			"Number of successfully applied updates per type_url",
			update_success.clone(),
		);
		let update_attempt = Family::default();
		registry.register(
			"update_attempt",
			"Number of update attempts per type_url",
			update_attempt.clone(),
		);

		Metrics {
			connection_terminations,
			message_types,
			total_messages_size,
			rate_limit_enforced,
			connected_state,
			pending_requests,
			update_rejected,
			update_success,
			update_attempt,
		}
	}
}
