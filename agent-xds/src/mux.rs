//! The aggregated discovery multiplexer (§4.C): one gRPC stream carrying many type_urls,
//! dispatching into per-type_url [`SubscriptionState`]s and a shared [`AckQueue`], with
//! node-identity elision (the `Node` is only attached to the first request of a stream) and a
//! pause/resume gate used while a dependent type_url (e.g. EDS) is not yet ready to be applied.
//!
//! Grounded on `src/xds/client.rs`'s `AdsClient` (single stream, multiple watch registrations,
//! `PausableAckQueue`, `ScopedResume` RAII handles) generalized from that file's single-purpose
//! client into a reusable multiplexer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agent_core::strng::Strng;

use crate::ack_queue::AckQueue;
use crate::error::RejectedConfig;
use crate::metrics::{ConnectionTermination, ConnectionTerminationReason, Metrics, TypeUrl};
use crate::node;
use crate::rate_limited_stream::{ConnectionState, RateLimitedStream};
use crate::subscription_state::{SubscriptionState, Variant};
use crate::types::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, Node};
use crate::watch_map::{WatchCallbacks, WatchId};

pub enum OutboundRequest {
	Sotw(DiscoveryRequest),
	Delta(DeltaDiscoveryRequest),
}

/// One type_url's operator-visible state, returned by [`GrpcMux::debug_dump`].
#[derive(Clone, Debug)]
pub struct SubscriptionDebug {
	pub type_url: Strng,
	pub requested_names: Vec<Strng>,
	pub known_version: Strng,
	pub last_nonce: Strng,
	pub paused: bool,
	pub watch_count: usize,
}

/// Consumer-supplied gate run before a response is committed (§4.B). The core never interprets
/// `value`; this is the only point where a consumer can reject a resource body and force a NACK.
pub type Validator = Box<dyn Fn(&[crate::types::Resource]) -> Result<(), Vec<RejectedConfig>> + Send + Sync>;

struct Inner {
	node: Node,
	node_sent: bool,
	order: Vec<Strng>,
	subscriptions: HashMap<Strng, SubscriptionState>,
	validators: HashMap<Strng, Validator>,
	ack_queue: AckQueue,
	stream: RateLimitedStream,
	metrics: Option<Arc<Metrics>>,
}

impl Inner {
	fn subscription_mut(&mut self, type_url: &Strng, variant: Variant) -> &mut SubscriptionState {
		if !self.subscriptions.contains_key(type_url) {
			self.order.push(type_url.clone());
			self.subscriptions.insert(type_url.clone(), SubscriptionState::new(type_url.clone(), variant));
		}
		self.subscriptions.get_mut(type_url).expect("just inserted")
	}

	fn resume(&mut self, type_url: &str) {
		self.ack_queue.resume(type_url);
		if let Some(state) = self.subscriptions.get_mut(type_url) {
			state.resume();
		}
		self.refresh_pending_requests_gauge();
	}

	/// Recomputes the "requests queued but not yet sent" gauge (§6): pending acks plus dirty,
	/// unpaused subscriptions.
	fn refresh_pending_requests_gauge(&self) {
		let Some(metrics) = &self.metrics else { return };
		let dirty = self.subscriptions.values().filter(|s| !s.paused() && s.is_dirty()).count();
		metrics.pending_requests.set((self.ack_queue.len() + dirty) as i64);
	}

	fn record_message_metrics(&self, type_url: &Strng, size: usize) {
		let Some(metrics) = &self.metrics else { return };
		let label = TypeUrl { type_url: type_url.clone() };
		metrics.message_types.get_or_create(&label).inc();
		metrics.total_messages_size.get_or_create(&label).inc_by(size as u64);
	}

	fn record_update_metrics(&self, type_url: &Strng, accepted: bool) {
		let Some(metrics) = &self.metrics else { return };
		let label = TypeUrl { type_url: type_url.clone() };
		metrics.update_attempt.get_or_create(&label).inc();
		if accepted {
			metrics.update_success.get_or_create(&label).inc();
		} else {
			metrics.update_rejected.get_or_create(&label).inc();
		}
	}
}

/// A guard that resumes a paused type_url when dropped. Mirrors the teacher's
/// `ScopedResume`/readiness `BlockReady` RAII idiom.
pub struct ScopedResume {
	inner: Arc<Mutex<Inner>>,
	type_url: Strng,
}

impl Drop for ScopedResume {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().unwrap();
		inner.resume(&self.type_url);
	}
}

#[derive(Clone)]
pub struct GrpcMux {
	inner: Arc<Mutex<Inner>>,
}

impl GrpcMux {
	pub fn new(burst: u32, fill_rate_per_sec: f64) -> Self {
		GrpcMux {
			inner: Arc::new(Mutex::new(Inner {
				node: node::node("", ""),
				node_sent: false,
				order: Vec::new(),
				subscriptions: HashMap::new(),
				validators: HashMap::new(),
				ack_queue: AckQueue::new(),
				stream: RateLimitedStream::new(burst, fill_rate_per_sec),
				metrics: None,
			})),
		}
	}

	/// Attaches the per-control-plane metrics (§6) to be updated as this mux runs. Optional: a mux
	/// with no metrics attached simply skips the bookkeeping.
	pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
		self.inner.lock().unwrap().metrics = Some(metrics);
		self
	}

	/// Overrides the `Node` identity sent on the first request of a stream with the process's
	/// configured `namespace`/`gateway` (§6), rather than relying solely on the downward-API
	/// environment variables `node::node` otherwise falls back to.
	pub fn with_identity(self, namespace: &str, gateway: &str) -> Self {
		self.inner.lock().unwrap().node = node::node(namespace, gateway);
		self
	}

	pub fn rate_limited_stream_state(&self) -> crate::rate_limited_stream::ConnectionState {
		self.inner.lock().unwrap().stream.state()
	}

	/// Per-type_url operator snapshot for the admin surface's `/debug/xds` route (§4.J):
	/// requested names, known version, last nonce, pause state, and watch count.
	pub fn debug_dump(&self) -> Vec<SubscriptionDebug> {
		let inner = self.inner.lock().unwrap();
		inner
			.order
			.iter()
			.filter_map(|type_url| inner.subscriptions.get(type_url))
			.map(|state| SubscriptionDebug {
				type_url: state.type_url().clone(),
				requested_names: state.requested_names().into_iter().collect(),
				known_version: state.known_version().clone(),
				last_nonce: state.last_nonce().clone(),
				paused: state.paused(),
				watch_count: state.watch_count(),
			})
			.collect()
	}

	pub fn start_connecting(&self) {
		self.inner.lock().unwrap().stream.start_connecting();
	}

	pub fn on_established(&self) {
		let mut inner = self.inner.lock().unwrap();
		inner.stream.on_established();
		if let Some(metrics) = &inner.metrics {
			metrics.connected_state.set(1);
		}
	}

	/// Call when the transport drops or fails to connect. Also marks every subscription's stream
	/// as stale so the next connection resends initial state, and returns the backoff to wait.
	pub fn on_disconnect(&self) -> std::time::Duration {
		let mut inner = self.inner.lock().unwrap();
		let delay = inner.stream.on_disconnect();
		inner.node_sent = false;
		for state in inner.subscriptions.values_mut() {
			state.mark_stream_fresh();
		}
		if let Some(metrics) = &inner.metrics {
			metrics.connected_state.set(0);
			metrics
				.connection_terminations
				.get_or_create(&ConnectionTermination { reason: ConnectionTerminationReason::Reconnect })
				.inc();
		}
		inner.refresh_pending_requests_gauge();
		delay
	}

	pub fn add_watch(
		&self,
		type_url: impl Into<Strng>,
		variant: Variant,
		resources: std::collections::HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> (Strng, WatchId) {
		let type_url = type_url.into();
		let mut inner = self.inner.lock().unwrap();
		let id = inner.subscription_mut(&type_url, variant).add_watch(resources, callbacks);
		inner.refresh_pending_requests_gauge();
		(type_url, id)
	}

	/// Namespace-mode variant of [`Self::add_watch`] (§8 "Namespace watches"): `resources` are
	/// prefixes, matched by `starts_with` against every resource name the subscription sees.
	pub fn add_namespace_watch(
		&self,
		type_url: impl Into<Strng>,
		variant: Variant,
		resources: std::collections::HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> (Strng, WatchId) {
		let type_url = type_url.into();
		let mut inner = self.inner.lock().unwrap();
		let id = inner.subscription_mut(&type_url, variant).add_namespace_watch(resources, callbacks);
		inner.refresh_pending_requests_gauge();
		(type_url, id)
	}

	pub fn update_watch(&self, type_url: &Strng, id: WatchId, new_resources: std::collections::HashSet<Strng>) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(state) = inner.subscriptions.get_mut(type_url) {
			state.update_watch(id, new_resources);
		}
		inner.refresh_pending_requests_gauge();
	}

	pub fn remove_watch(&self, type_url: &Strng, id: WatchId) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(state) = inner.subscriptions.get_mut(type_url) {
			state.remove_watch(id);
		}
		inner.refresh_pending_requests_gauge();
	}

	/// Registers the consumer validation gate for `type_url`. Responses for types with no
	/// registered validator are accepted unconditionally once past the core's own structural
	/// checks (duplicate names, type_url match).
	pub fn set_validator(&self, type_url: impl Into<Strng>, validator: Validator) {
		self.inner.lock().unwrap().validators.insert(type_url.into(), validator);
	}

	/// Pauses delivery of acks for `type_url` until the returned guard is dropped. Used to hold
	/// back a dependent type_url (e.g. EDS) while its prerequisite (CDS) is still warming.
	pub fn pause(&self, type_url: impl Into<Strng>) -> ScopedResume {
		let type_url = type_url.into();
		let mut inner = self.inner.lock().unwrap();
		inner.ack_queue.pause(type_url.clone());
		if let Some(state) = inner.subscriptions.get_mut(&type_url) {
			state.pause();
		}
		drop(inner);
		ScopedResume { inner: self.inner.clone(), type_url }
	}

	/// Builds the next request to send, if the pacing limit and connection state allow it.
	/// Returns `None` when there is nothing to send or the rate limit is not yet satisfied.
	pub fn next_request(&self) -> Option<OutboundRequest> {
		let mut inner = self.inner.lock().unwrap();
		if !inner.stream.try_send() {
			// Only a message that was otherwise eligible (stream established) but blocked on a
			// token counts as the rate limit actually doing something (§4.A observability hook).
			if inner.stream.state() == ConnectionState::Established {
				if let Some(metrics) = &inner.metrics {
					metrics.rate_limit_enforced.inc();
				}
			}
			return None;
		}

		if let Some(ack) = inner.ack_queue.take_next_ready() {
			let node_sent = inner.node_sent;
			inner.node_sent = true;
			if let Some(state) = inner.subscriptions.get_mut(&ack.type_url) {
				let req = Self::finish(state, node_sent, inner.node.clone());
				inner.refresh_pending_requests_gauge();
				return Some(req);
			}
		}

		let order = inner.order.clone();
		for type_url in order {
			let node_sent = inner.node_sent;
			let Some(sub) = inner.subscriptions.get(&type_url) else {
				continue;
			};
			if sub.paused() || !sub.is_dirty() {
				continue;
			}
			inner.node_sent = true;
			let node = inner.node.clone();
			let state = inner.subscriptions.get_mut(&type_url).expect("checked above");
			let req = Self::finish(state, node_sent, node);
			inner.refresh_pending_requests_gauge();
			return Some(req);
		}
		None
	}

	fn finish(state: &mut SubscriptionState, node_sent: bool, node: Node) -> OutboundRequest {
		let is_sotw = matches!(state.variant(), Variant::Sotw);
		if is_sotw {
			let mut req = state.build_sotw_request();
			if !node_sent {
				req.node = Some(node);
			}
			OutboundRequest::Sotw(req)
		} else {
			let mut req = state.build_delta_request();
			if !node_sent {
				req.node = Some(node);
			}
			OutboundRequest::Delta(req)
		}
	}

	/// Applies an inbound sotw message, dispatching to whatever validator was registered for its
	/// type_url via [`Self::set_validator`] (or accepting unconditionally if none was).
	pub fn handle_sotw_message(&self, response: DiscoveryResponse) {
		let type_url = Strng::from(response.type_url.as_str());
		let result = {
			let inner = self.inner.lock().unwrap();
			inner.validators.get(&type_url).map(|v| v(&response.resources))
		};
		self.handle_sotw_response(response, |_| result.unwrap_or(Ok(())));
	}

	/// Applies an inbound delta message; see [`Self::handle_sotw_message`].
	pub fn handle_delta_message(&self, response: DeltaDiscoveryResponse) {
		let type_url = Strng::from(response.type_url.as_str());
		let result = {
			let inner = self.inner.lock().unwrap();
			inner.validators.get(&type_url).map(|v| v(&response.resources))
		};
		self.handle_delta_response(response, |_| result.unwrap_or(Ok(())));
	}

	fn handle_sotw_response(
		&self,
		response: DiscoveryResponse,
		validate: impl FnOnce(&[crate::types::Resource]) -> Result<(), Vec<RejectedConfig>>,
	) {
		use prost::Message;
		let type_url = Strng::from(response.type_url.as_str());
		let mut inner = self.inner.lock().unwrap();
		inner.record_message_metrics(&type_url, response.encoded_len());
		if let Some(state) = inner.subscriptions.get_mut(&type_url) {
			let accepted =
				state.handle_sotw_response(response.version_info, response.nonce, response.resources, validate);
			inner.record_update_metrics(&type_url, accepted);
			inner.ack_queue.push(type_url);
			inner.refresh_pending_requests_gauge();
		}
	}

	fn handle_delta_response(
		&self,
		response: DeltaDiscoveryResponse,
		validate: impl FnOnce(&[crate::types::Resource]) -> Result<(), Vec<RejectedConfig>>,
	) {
		use prost::Message;
		let type_url = Strng::from(response.type_url.as_str());
		let mut inner = self.inner.lock().unwrap();
		inner.record_message_metrics(&type_url, response.encoded_len());
		if let Some(state) = inner.subscriptions.get_mut(&type_url) {
			let accepted = state.handle_delta_response(
				response.system_version_info,
				response.nonce,
				response.resources,
				response.removed_resources,
				validate,
			);
			inner.record_update_metrics(&type_url, accepted);
			inner.ack_queue.push(type_url);
			inner.refresh_pending_requests_gauge();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	struct Noop;
	impl WatchCallbacks for Noop {
		fn deliver(&self, _update: crate::watch_map::WatchDelivery) {}
		fn on_failure(&self, _error: &str) {}
	}

	fn request_type_url(req: &OutboundRequest) -> &str {
		match req {
			OutboundRequest::Sotw(r) => &r.type_url,
			OutboundRequest::Delta(r) => &r.type_url,
		}
	}

	fn request_has_node(req: &OutboundRequest) -> bool {
		match req {
			OutboundRequest::Sotw(r) => r.node.is_some(),
			OutboundRequest::Delta(r) => r.node.is_some(),
		}
	}

	fn established_mux() -> GrpcMux {
		let mux = GrpcMux::new(100, 100.0);
		mux.start_connecting();
		mux.on_established();
		mux
	}

	fn delta_response(type_url: &str, nonce: &str) -> DeltaDiscoveryResponse {
		DeltaDiscoveryResponse {
			type_url: type_url.to_string(),
			resources: vec![],
			removed_resources: vec![],
			nonce: nonce.to_string(),
			system_version_info: "1".to_string(),
			control_plane: None,
		}
	}

	#[test]
	fn subscription_interest_requests_are_emitted_in_registration_order() {
		let mux = established_mux();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.add_watch("Listener", Variant::Delta, HashSet::new(), Box::new(Noop));

		let first = mux.next_request().unwrap();
		assert_eq!(request_type_url(&first), "Cluster");
		let second = mux.next_request().unwrap();
		assert_eq!(request_type_url(&second), "Listener");
		assert!(mux.next_request().is_none(), "nothing left to send");
	}

	#[test]
	fn pending_acks_take_priority_over_subscription_interest_updates() {
		let mux = established_mux();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.add_watch("Listener", Variant::Delta, HashSet::new(), Box::new(Noop));
		// Drain the two initial subscription requests.
		mux.next_request().unwrap();
		mux.next_request().unwrap();
		assert!(mux.next_request().is_none());

		// A response for Listener queues an ack; a fresh watch makes Cluster dirty again. Even
		// though Cluster comes first in registration order, the pending ack must go out first.
		mux.handle_delta_message(delta_response("Listener", "n1"));
		mux.add_watch("Cluster", Variant::Delta, HashSet::from([Strng::from("x")]), Box::new(Noop));

		let next = mux.next_request().unwrap();
		assert_eq!(request_type_url(&next), "Listener");
	}

	#[test]
	fn node_identity_is_sent_once_per_stream_and_resent_after_reconnect() {
		let mux = established_mux();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		let first = mux.next_request().unwrap();
		assert!(request_has_node(&first), "first request of a stream must carry node identity");

		mux.add_watch("Cluster", Variant::Delta, HashSet::from([Strng::from("a")]), Box::new(Noop));
		let second = mux.next_request().unwrap();
		assert!(!request_has_node(&second), "node identity is elided after the first request");

		mux.on_disconnect();
		mux.on_established();
		mux.add_watch("Cluster", Variant::Delta, HashSet::from([Strng::from("b")]), Box::new(Noop));
		let after_reconnect = mux.next_request().unwrap();
		assert!(request_has_node(&after_reconnect), "reconnecting must re-attach node identity to the first request");
	}

	#[test]
	fn paused_type_url_emits_nothing_until_resumed() {
		let mux = established_mux();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.next_request().unwrap(); // drain the initial request

		let guard = mux.pause("Cluster");
		mux.add_watch("Cluster", Variant::Delta, HashSet::from([Strng::from("x")]), Box::new(Noop));
		assert!(mux.next_request().is_none(), "paused type_url must not emit a request while held");

		drop(guard);
		let resumed = mux.next_request().unwrap();
		assert_eq!(request_type_url(&resumed), "Cluster");
	}

	#[test]
	fn debug_dump_reflects_watch_count_and_pause_state() {
		let mux = established_mux();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		let guard = mux.pause("Cluster");

		let dump = mux.debug_dump();
		let cluster = dump.iter().find(|d| d.type_url.as_str() == "Cluster").unwrap();
		assert_eq!(cluster.watch_count, 2);
		assert!(cluster.paused);
		assert_eq!(cluster.known_version.as_str(), "");

		drop(guard);
		assert!(!mux.debug_dump().iter().find(|d| d.type_url.as_str() == "Cluster").unwrap().paused);
	}

	#[test]
	fn metrics_track_connection_state_and_rejected_updates() {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(crate::metrics::Metrics::new(&mut registry));
		let mux = GrpcMux::new(100, 100.0).with_metrics(metrics.clone());
		mux.start_connecting();
		mux.on_established();
		assert_eq!(metrics.connected_state.get(), 1);

		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.next_request().unwrap();

		let mut response = delta_response("Cluster", "n1");
		response.resources = vec![crate::types::Resource {
			name: "a".to_string(),
			version: "1".to_string(),
			value: vec![],
			type_url: "Listener".to_string(), // mismatched type_url forces a NACK
		}];
		mux.handle_delta_message(response);
		assert_eq!(metrics.update_rejected.get_or_create(&TypeUrl { type_url: Strng::from("Cluster") }).get(), 1);
		assert_eq!(metrics.update_attempt.get_or_create(&TypeUrl { type_url: Strng::from("Cluster") }).get(), 1);

		mux.on_disconnect();
		assert_eq!(metrics.connected_state.get(), 0);
	}

	#[test]
	fn rate_limit_exhaustion_is_counted_once_established() {
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(crate::metrics::Metrics::new(&mut registry));
		let mux = GrpcMux::new(1, 0.001).with_metrics(metrics.clone());
		mux.start_connecting();
		mux.on_established();
		mux.add_watch("Cluster", Variant::Delta, HashSet::new(), Box::new(Noop));
		mux.add_watch("Listener", Variant::Delta, HashSet::new(), Box::new(Noop));

		mux.next_request().unwrap(); // consumes the single burst token
		assert!(mux.next_request().is_none(), "no tokens left");
		assert_eq!(metrics.rate_limit_enforced.get(), 1);
	}
}
