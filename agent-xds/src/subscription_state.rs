//! Per-type_url protocol state (§4.B): tracks `requested_names`/`known_version`/`last_nonce`,
//! owns the [`WatchMap`](crate::watch_map::WatchMap) for that type_url, and builds the next
//! outbound request in either sotw or delta shape.
//!
//! Grounded on the nonce/version bookkeeping described by
//! `source/common/config/xds_mux/{sotw,delta}_subscription_state` (no Rust source for these
//! exists in the retrieved pack; this is a fresh port of their documented contract).

use std::collections::HashSet;

use agent_core::strng::Strng;

use crate::error::RejectedConfig;
use crate::types::{DeltaDiscoveryRequest, DiscoveryRequest, Resource, Status};
use crate::watch_map::{WatchCallbacks, WatchId, WatchMap};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
	Sotw,
	Delta,
}

/// Outcome of [`SubscriptionState::handle_response`], to be pushed onto the multiplexer's
/// cross-type [`crate::ack_queue::AckQueue`].
#[derive(Clone, Debug)]
pub struct AckOutcome {
	pub type_url: Strng,
	pub accepted: bool,
}

pub struct SubscriptionState {
	type_url: Strng,
	variant: Variant,
	watch_map: WatchMap,
	known_version: Strng,
	last_nonce: Strng,
	pending_error: Option<String>,
	paused: bool,
	pending_while_paused: bool,
	initial_request_sent: bool,
	pending_subscribe: HashSet<Strng>,
	pending_unsubscribe: HashSet<Strng>,
	initial_resource_versions: std::collections::HashMap<Strng, Strng>,
}

impl SubscriptionState {
	pub fn new(type_url: impl Into<Strng>, variant: Variant) -> Self {
		SubscriptionState {
			type_url: type_url.into(),
			variant,
			watch_map: WatchMap::new(),
			known_version: Strng::from(""),
			last_nonce: Strng::from(""),
			pending_error: None,
			paused: false,
			pending_while_paused: false,
			initial_request_sent: false,
			pending_subscribe: HashSet::new(),
			pending_unsubscribe: HashSet::new(),
			initial_resource_versions: Default::default(),
		}
	}

	pub fn type_url(&self) -> &Strng {
		&self.type_url
	}

	pub fn variant(&self) -> Variant {
		self.variant
	}

	/// True when the next request should omit (sotw) or wildcard-marker (delta) the resource
	/// list: either no watch names anything explicitly, or at least one watch is itself wildcard
	/// (§8 invariant: "wildcard presence iff any watch is wildcard" — a coexisting named watch
	/// does not narrow a wildcard subscription, since the control plane can't partially wildcard).
	pub fn is_wildcard(&self) -> bool {
		self.watch_map.has_wildcard_watch() || self.watch_map.requested_names().is_empty()
	}

	pub fn requested_names(&self) -> HashSet<Strng> {
		self.watch_map.requested_names()
	}

	pub fn watch_count(&self) -> usize {
		self.watch_map.len()
	}

	/// Registers a new watch. `resources` empty means wildcard. Returns the watch id for later
	/// update/removal.
	pub fn add_watch(
		&mut self,
		resources: HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> WatchId {
		let (id, added) = self.watch_map.add_watch(resources, callbacks);
		self.record_subscription_change(added, HashSet::new());
		id
	}

	/// Registers a namespace-mode watch (§8 "Namespace watches"): `resources` are prefixes, and
	/// the watch receives every resource whose name begins with one of them.
	pub fn add_namespace_watch(
		&mut self,
		resources: HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> WatchId {
		let (id, added) = self.watch_map.add_namespace_watch(resources, callbacks);
		self.record_subscription_change(added, HashSet::new());
		id
	}

	pub fn update_watch(&mut self, id: WatchId, new_resources: HashSet<Strng>) {
		let (added, removed) = self.watch_map.update_watch(id, new_resources);
		self.record_subscription_change(added, removed);
	}

	pub fn remove_watch(&mut self, id: WatchId) {
		let removed = self.watch_map.remove_watch(id);
		self.record_subscription_change(HashSet::new(), removed);
	}

	fn record_subscription_change(&mut self, added: HashSet<Strng>, removed: HashSet<Strng>) {
		if added.is_empty() && removed.is_empty() {
			return;
		}
		for name in &removed {
			self.pending_subscribe.remove(name);
			self.pending_unsubscribe.insert(name.clone());
			self.initial_resource_versions.remove(name);
		}
		for name in &added {
			self.pending_unsubscribe.remove(name);
			self.pending_subscribe.insert(name.clone());
		}
		if self.paused {
			self.pending_while_paused = true;
		}
	}

	pub fn is_dirty(&self) -> bool {
		!self.pending_subscribe.is_empty() || !self.pending_unsubscribe.is_empty() || !self.initial_request_sent
	}

	pub fn pause(&mut self) {
		self.paused = true;
	}

	/// Returns whether a pump should be triggered (state changed while paused).
	pub fn resume(&mut self) -> bool {
		self.paused = false;
		std::mem::take(&mut self.pending_while_paused)
	}

	pub fn paused(&self) -> bool {
		self.paused
	}

	pub fn known_version(&self) -> &Strng {
		&self.known_version
	}

	pub fn last_nonce(&self) -> &Strng {
		&self.last_nonce
	}

	pub fn mark_stream_fresh(&mut self) {
		self.initial_request_sent = false;
		self.last_nonce = Strng::from("");
	}

	pub fn nack(&mut self, reason: String) {
		self.pending_error = Some(reason);
	}

	/// Builds the next state-of-the-world request. Caller (the multiplexer) is responsible for
	/// attaching `node` per the node-identity-elision rule.
	pub fn build_sotw_request(&mut self) -> DiscoveryRequest {
		debug_assert_eq!(self.variant, Variant::Sotw);
		let wildcard = self.is_wildcard();
		let mut resource_names: Vec<String> = if wildcard {
			vec![]
		} else {
			self.requested_names().into_iter().map(|s| s.to_string()).collect()
		};
		resource_names.sort();
		let error_detail = self.pending_error.take().map(|m| Status { code: 3, message: m });
		self.pending_subscribe.clear();
		self.pending_unsubscribe.clear();
		self.initial_request_sent = true;
		DiscoveryRequest {
			node: None,
			resource_names,
			type_url: self.type_url.to_string(),
			version_info: self.known_version.to_string(),
			response_nonce: self.last_nonce.to_string(),
			error_detail,
		}
	}

	/// Builds the next incremental request, flushing only the accumulated subscribe/unsubscribe
	/// delta since the last request (not the full desired set).
	pub fn build_delta_request(&mut self) -> DeltaDiscoveryRequest {
		debug_assert_eq!(self.variant, Variant::Delta);
		let subscribe: Vec<String> = self.pending_subscribe.drain().map(|s| s.to_string()).collect();
		let unsubscribe: Vec<String> = self.pending_unsubscribe.drain().map(|s| s.to_string()).collect();
		let error_detail = self.pending_error.take().map(|m| Status { code: 3, message: m });
		let initial_resource_versions = if !self.initial_request_sent {
			self
				.initial_resource_versions
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect()
		} else {
			Default::default()
		};
		self.initial_request_sent = true;
		DeltaDiscoveryRequest {
			node: None,
			type_url: self.type_url.to_string(),
			resource_names_subscribe: subscribe,
			resource_names_unsubscribe: unsubscribe,
			initial_resource_versions,
			response_nonce: self.last_nonce.to_string(),
			error_detail,
		}
	}

	/// Applies a sotw response. `validate` is the consumer gate: if it rejects, the whole
	/// response is NACKed and nothing is delivered to watches.
	pub fn handle_sotw_response(
		&mut self,
		version_info: String,
		nonce: String,
		resources: Vec<Resource>,
		validate: impl FnOnce(&[Resource]) -> Result<(), Vec<RejectedConfig>>,
	) -> bool {
		self.last_nonce = Strng::from(nonce);

		if let Some(dup) = first_duplicate(&resources) {
			let msg = format!("duplicate resource name in response: {dup}");
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}
		if let Some(bad) = resources.iter().find(|r| r.type_url != self.type_url.as_str()) {
			let msg = format!("type_url mismatch: expected {}, got {}", self.type_url, bad.type_url);
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}
		if let Err(rejected) = validate(&resources) {
			let msg = rejected.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("; ");
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}

		self.known_version = Strng::from(version_info);
		for name in resources.iter() {
			self
				.initial_resource_versions
				.insert(Strng::from(name.name.as_str()), Strng::from(name.version.as_str()));
		}
		self.watch_map.deliver_sotw(resources);
		true
	}

	/// Applies a delta response.
	pub fn handle_delta_response(
		&mut self,
		system_version_info: String,
		nonce: String,
		resources: Vec<Resource>,
		removed_resources: Vec<String>,
		validate: impl FnOnce(&[Resource]) -> Result<(), Vec<RejectedConfig>>,
	) -> bool {
		self.last_nonce = Strng::from(nonce);

		if let Some(dup) = first_duplicate(&resources) {
			let msg = format!("duplicate resource name in response: {dup}");
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}
		if let Some(bad) = resources.iter().find(|r| r.type_url != self.type_url.as_str()) {
			let msg = format!("type_url mismatch: expected {}, got {}", self.type_url, bad.type_url);
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}
		if let Err(rejected) = validate(&resources) {
			let msg = rejected.iter().map(|r| r.to_string()).collect::<Vec<_>>().join("; ");
			self.nack(msg.clone());
			self.watch_map.notify_failure(&msg);
			return false;
		}

		self.known_version = Strng::from(system_version_info);
		for r in &resources {
			self
				.initial_resource_versions
				.insert(Strng::from(r.name.as_str()), Strng::from(r.version.as_str()));
		}
		let removed: Vec<Strng> = removed_resources.into_iter().map(Strng::from).collect();
		for name in &removed {
			self.initial_resource_versions.remove(name);
		}
		self.watch_map.deliver_delta(resources, removed);
		true
	}
}

fn first_duplicate(resources: &[Resource]) -> Option<String> {
	let mut seen = HashSet::new();
	for r in resources {
		if !seen.insert(r.name.as_str()) {
			return Some(r.name.clone());
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::watch_map::WatchDelivery;

	struct Noop;
	impl WatchCallbacks for Noop {
		fn deliver(&self, _update: WatchDelivery) {}
		fn on_failure(&self, _error: &str) {}
	}

	fn resource(name: &str, version: &str) -> Resource {
		Resource {
			name: name.to_string(),
			version: version.to_string(),
			value: vec![],
			type_url: "Cluster".to_string(),
		}
	}

	#[test]
	fn sotw_wildcard_then_named_emits_requests_matching_spec_round_trip() {
		let mut state = SubscriptionState::new("Cluster", Variant::Sotw);
		let id = state.add_watch(HashSet::from([Strng::from("A"), Strng::from("B")]), Box::new(Noop));
		let req = state.build_sotw_request();
		assert_eq!(req.resource_names, vec!["A", "B"]);

		state.update_watch(id, HashSet::from([Strng::from("B"), Strng::from("C")]));
		let req = state.build_sotw_request();
		assert_eq!(req.resource_names, vec!["B", "C"]);

		state.update_watch(id, HashSet::new());
		let req = state.build_sotw_request();
		assert!(req.resource_names.is_empty());
		assert!(state.is_wildcard());
	}

	#[test]
	fn wildcard_watch_stays_wildcard_alongside_a_coexisting_named_watch() {
		let mut state = SubscriptionState::new("Cluster", Variant::Sotw);
		state.add_watch(HashSet::new(), Box::new(Noop));
		state.add_watch(HashSet::from([Strng::from("A")]), Box::new(Noop));
		// The named watch's interest must not narrow the subscription: the control plane can't
		// partially wildcard, so the request still omits the resource list entirely.
		assert!(state.is_wildcard());
		let req = state.build_sotw_request();
		assert!(req.resource_names.is_empty());
	}

	#[test]
	fn nonce_is_echoed_after_ack() {
		let mut state = SubscriptionState::new("Cluster", Variant::Sotw);
		state.add_watch(HashSet::new(), Box::new(Noop));
		let _ = state.build_sotw_request();
		let accepted =
			state.handle_sotw_response("1".into(), "nonce-1".into(), vec![resource("A", "1")], |_| Ok(()));
		assert!(accepted);
		let req = state.build_sotw_request();
		assert_eq!(req.response_nonce, "nonce-1");
		assert_eq!(req.version_info, "1");
	}

	#[test]
	fn duplicate_name_rejects_whole_response_without_advancing_version() {
		let mut state = SubscriptionState::new("Cluster", Variant::Sotw);
		state.add_watch(HashSet::new(), Box::new(Noop));
		let accepted = state.handle_sotw_response(
			"1".into(),
			"n1".into(),
			vec![resource("A", "1"), resource("A", "2")],
			|_| Ok(()),
		);
		assert!(!accepted);
		assert_eq!(state.known_version.as_str(), "");
	}

	#[test]
	fn delta_request_only_flushes_the_incremental_change() {
		let mut state = SubscriptionState::new("ClusterLoadAssignment", Variant::Delta);
		let id = state.add_watch(HashSet::from([Strng::from("A")]), Box::new(Noop));
		let req = state.build_delta_request();
		assert_eq!(req.resource_names_subscribe, vec!["A"]);
		assert!(req.resource_names_unsubscribe.is_empty());

		state.update_watch(id, HashSet::from([Strng::from("B")]));
		let req = state.build_delta_request();
		assert_eq!(req.resource_names_subscribe, vec!["B"]);
		assert_eq!(req.resource_names_unsubscribe, vec!["A"]);
	}
}
