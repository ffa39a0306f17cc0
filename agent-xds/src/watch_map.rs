//! Many-watchers-to-one-subscription fan-out for a single type_url.
//!
//! Ported from `source/common/config/watch_map.cc`: `addWatch`/`removeWatch`/
//! `updateWatchInterest` maintain a `name -> interested watch_ids` index (plus a separate wildcard
//! set) and compute the minimal subscription delta; `onConfigUpdate` (both the sotw and delta
//! overloads) fan resource updates back out to exactly the watches that should see them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use agent_core::strng::Strng;

use crate::types::Resource;

pub type WatchId = u64;

/// What a single watch receives in one delivery: all its additions/modifications combined into
/// one callback, plus all its removals, per the ordering guarantee in §4.D.
#[derive(Clone, Debug, Default)]
pub struct WatchDelivery {
	pub added: Vec<Resource>,
	pub removed: Vec<Strng>,
}

/// Consumer-supplied validation/delivery hooks for one watch. `validate` is called before any
/// state is committed: if it rejects, the whole response is NACKed and no watch is delivered to
/// (mirrors the `SubscriptionCallbacks::onConfigUpdate` contract, which can throw to reject).
pub trait WatchCallbacks: Send + Sync {
	fn deliver(&self, update: WatchDelivery);
	fn on_failure(&self, error: &str);
}

struct Watch {
	resource_names: HashSet<Strng>, // empty == wildcard; namespace prefixes when namespace_mode
	namespace_mode: bool,
	// Last resource-name set this watch was actually delivered, only tracked for namespace-mode
	// watches (§8 "Namespace watches"): a prefix watch's own resource_names holds prefixes, not
	// literal names, so sotw implicit-removal has to diff against what was last matched instead.
	delivered: HashSet<Strng>,
	callbacks: Box<dyn WatchCallbacks>,
}

/// Per-type_url watch fan-out table. Main-thread-only (§5 Shared resources).
pub struct WatchMap {
	next_id: AtomicU64,
	watches_by_id: HashMap<WatchId, Watch>,
	watchers_by_resource: HashMap<Strng, HashSet<WatchId>>,
	// Same bookkeeping as `watchers_by_resource`, but keyed by namespace prefix rather than exact
	// resource name (§8 "the subscription tracks such names with a suffix glob rather than exact
	// match"). Kept separate because a prefix is matched by `starts_with`, not hash lookup.
	namespace_watchers: HashMap<Strng, HashSet<WatchId>>,
	wildcard_watches: HashSet<WatchId>,
}

impl Default for WatchMap {
	fn default() -> Self {
		Self::new()
	}
}

impl WatchMap {
	pub fn new() -> Self {
		WatchMap {
			next_id: AtomicU64::new(1),
			watches_by_id: HashMap::new(),
			watchers_by_resource: HashMap::new(),
			namespace_watchers: HashMap::new(),
			wildcard_watches: HashSet::new(),
		}
	}

	pub fn len(&self) -> usize {
		self.watches_by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.watches_by_id.is_empty()
	}

	/// All names any watch cares about; empty iff no watch exists. Does not include wildcard.
	/// Namespace prefixes are included verbatim, the same way the original spec's wire request
	/// carries the glob itself rather than any name it might later match.
	pub fn requested_names(&self) -> HashSet<Strng> {
		self.watchers_by_resource.keys().chain(self.namespace_watchers.keys()).cloned().collect()
	}

	pub fn has_wildcard_watch(&self) -> bool {
		!self.wildcard_watches.is_empty()
	}

	pub fn add_watch(
		&mut self,
		resources: HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> (WatchId, HashSet<Strng>) {
		self.add_watch_inner(resources, false, callbacks)
	}

	/// Like [`Self::add_watch`], but `resources` are namespace prefixes: the watch matches every
	/// resource whose name begins with one of them, rather than matching names exactly (§8
	/// "Namespace watches"). Wildcard (empty `resources`) is unaffected by this flag.
	pub fn add_namespace_watch(
		&mut self,
		resources: HashSet<Strng>,
		callbacks: Box<dyn WatchCallbacks>,
	) -> (WatchId, HashSet<Strng>) {
		self.add_watch_inner(resources, true, callbacks)
	}

	fn add_watch_inner(
		&mut self,
		resources: HashSet<Strng>,
		namespace_mode: bool,
		callbacks: Box<dyn WatchCallbacks>,
	) -> (WatchId, HashSet<Strng>) {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let added = self.insert_interest(id, &resources, namespace_mode);
		self.watches_by_id.insert(
			id,
			Watch {
				resource_names: resources,
				namespace_mode,
				delivered: HashSet::new(),
				callbacks,
			},
		);
		(id, added)
	}

	/// Returns `(added_to_sub, removed_from_sub)`: the names whose *total* interest count crossed
	/// 0->1 or 1->0 as a result of this one watch's change. These, not the watch's own full set,
	/// are what the subscription state needs to shape its next request. Preserves the watch's
	/// existing namespace-mode flag.
	pub fn update_watch(
		&mut self,
		id: WatchId,
		new_resources: HashSet<Strng>,
	) -> (HashSet<Strng>, HashSet<Strng>) {
		let Some(watch) = self.watches_by_id.get(&id) else {
			return (HashSet::new(), HashSet::new());
		};
		let namespace_mode = watch.namespace_mode;
		let old_resources = watch.resource_names.clone();
		self.remove_interest(id, &old_resources, namespace_mode);
		let added = self.insert_interest(id, &new_resources, namespace_mode);
		let index = if namespace_mode { &self.namespace_watchers } else { &self.watchers_by_resource };
		let removed = old_resources.difference(&new_resources).filter(|n| !index.contains_key(*n)).cloned().collect();
		if let Some(w) = self.watches_by_id.get_mut(&id) {
			w.resource_names = new_resources;
		}
		(added, removed)
	}

	/// Removes a watch entirely; returns names that lost their last interested watch.
	pub fn remove_watch(&mut self, id: WatchId) -> HashSet<Strng> {
		let Some(watch) = self.watches_by_id.remove(&id) else {
			return HashSet::new();
		};
		self.remove_interest(id, &watch.resource_names, watch.namespace_mode)
	}

	fn insert_interest(&mut self, id: WatchId, resources: &HashSet<Strng>, namespace_mode: bool) -> HashSet<Strng> {
		if resources.is_empty() {
			self.wildcard_watches.insert(id);
			return HashSet::new();
		}
		let index = if namespace_mode { &mut self.namespace_watchers } else { &mut self.watchers_by_resource };
		let mut added = HashSet::new();
		for name in resources {
			let set = index.entry(name.clone()).or_default();
			let was_empty = set.is_empty();
			set.insert(id);
			if was_empty {
				added.insert(name.clone());
			}
		}
		added
	}

	fn remove_interest(&mut self, id: WatchId, resources: &HashSet<Strng>, namespace_mode: bool) -> HashSet<Strng> {
		if resources.is_empty() {
			self.wildcard_watches.remove(&id);
			return HashSet::new();
		}
		let index = if namespace_mode { &mut self.namespace_watchers } else { &mut self.watchers_by_resource };
		let mut removed = HashSet::new();
		for name in resources {
			if let Some(set) = index.get_mut(name) {
				set.remove(&id);
				if set.is_empty() {
					index.remove(name);
					removed.insert(name.clone());
				}
			}
		}
		removed
	}

	fn watches_for(&self, name: &str) -> HashSet<WatchId> {
		let mut ids: HashSet<WatchId> = self
			.watchers_by_resource
			.get(name)
			.cloned()
			.unwrap_or_default();
		ids.extend(self.wildcard_watches.iter().copied());
		for (prefix, watch_ids) in &self.namespace_watchers {
			if name.starts_with(prefix.as_str()) {
				ids.extend(watch_ids.iter().copied());
			}
		}
		ids
	}

	/// State-of-the-world delivery: every watch is re-delivered its full current view, including
	/// implicit removals for names no longer present in the snapshot so deletions propagate. A
	/// namespace-mode watch's `resource_names` holds prefixes, not literal names, so its implicit
	/// removals are computed against what it was last actually delivered rather than its own set.
	pub fn deliver_sotw(&mut self, resources: Vec<Resource>) {
		let mut per_watch: HashMap<WatchId, WatchDelivery> = HashMap::new();
		let mut present: HashSet<Strng> = HashSet::new();
		let mut matched: HashMap<WatchId, HashSet<Strng>> = HashMap::new();

		for r in resources {
			let name: Strng = r.name.clone().into();
			present.insert(name.clone());
			for id in self.watches_for(&r.name) {
				per_watch.entry(id).or_default().added.push(r.clone());
				matched.entry(id).or_default().insert(name.clone());
			}
		}

		let mut ids: Vec<WatchId> = self.watches_by_id.keys().copied().collect();
		ids.sort_unstable();
		for id in ids {
			let watch = self.watches_by_id.get_mut(&id).expect("id drawn from watches_by_id");
			let mut delivery = per_watch.remove(&id).unwrap_or_default();
			let now_matched = matched.remove(&id).unwrap_or_default();
			if watch.namespace_mode {
				for name in watch.delivered.difference(&now_matched) {
					delivery.removed.push(name.clone());
				}
				watch.delivered = now_matched;
			} else if !watch.resource_names.is_empty() {
				for name in &watch.resource_names {
					if !present.contains(name) {
						delivery.removed.push(name.clone());
					}
				}
			}
			if !delivery.added.is_empty() || !delivery.removed.is_empty() {
				watch.callbacks.deliver(delivery);
			}
		}
	}

	/// Incremental delivery: only watches that actually gained or lost a resource are called.
	pub fn deliver_delta(&self, added: Vec<Resource>, removed_names: Vec<Strng>) {
		let mut per_watch: HashMap<WatchId, WatchDelivery> = HashMap::new();

		for r in added {
			for id in self.watches_for(&r.name) {
				per_watch.entry(id).or_default().added.push(r.clone());
			}
		}
		for name in removed_names {
			for id in self.watches_for(&name) {
				per_watch.entry(id).or_default().removed.push(name.clone());
			}
		}

		let mut ids: Vec<WatchId> = per_watch.keys().copied().collect();
		ids.sort_unstable();
		for id in ids {
			if let Some(watch) = self.watches_by_id.get(&id) {
				watch.callbacks.deliver(per_watch.remove(&id).unwrap());
			}
		}
	}

	/// Informs every watch once that the subscription failed (NACK or parse failure).
	pub fn notify_failure(&self, error: &str) {
		let mut ids: Vec<WatchId> = self.watches_by_id.keys().copied().collect();
		ids.sort_unstable();
		for id in ids {
			self.watches_by_id[&id].callbacks.on_failure(error);
		}
	}
}
