//! The cluster warm/swap engine (component F, §4.F) plus on-demand discovery wiring
//! (component G, §4.G) layered on top of it.
//!
//! Grounded on `examples/original_source/include/envoy/upstream/cluster_manager.h`'s
//! `ClusterManager` interface (`addOrUpdateCluster`, `ClusterInfoMaps{active_clusters_,
//! warming_clusters_}`, `getThreadLocalCluster`, `setPrimaryClustersInitializedCb`/
//! `setInitializedCb`) and `crates/agentgateway/src/store/discovery.rs`'s `Store`/`StoreUpdater`
//! full-state diff against a previous snapshot (`PreviousState`) for the atomic-publication idiom.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use agent_core::strng::Strng;
use agent_xds::{RejectedConfig, XdsUpdate};
use arc_swap::ArcSwap;

use crate::callbacks::{ClusterUpdateCallbacks, ClusterUpdateCallbacksHandle, ClusterUpdateCallbacksRegistry};
use crate::cluster::{Cluster, ClusterConfig, ClusterLoadAssignmentConfig, EndpointConfig};
use crate::metrics::Metrics;
use crate::on_demand::{ClusterDiscoveryCallbackHandle, ClusterDiscoveryStatus, OnDemandTable};

/// The immutable per-worker view published on every change. Workers hold a cloned `Arc` to this
/// type via [`ClusterManager::snapshot_handle`] and never see a partially-updated map.
pub type ClusterSnapshot = HashMap<Strng, Arc<Cluster>>;

struct Warming {
	config: ClusterConfig,
	endpoints: Option<Vec<EndpointConfig>>,
	health_check_done: bool,
}

impl Warming {
	fn new(config: ClusterConfig) -> Self {
		let health_check_done = !config.has_active_health_check;
		let endpoints = if config.discovery_type() == crate::cluster::DiscoveryType::Eds {
			None
		} else {
			Some(config.static_endpoints.clone())
		};
		Warming { config, endpoints, health_check_done }
	}

	fn ready(&self) -> bool {
		self.endpoints.is_some() && self.health_check_done
	}
}

/// Owns the authoritative cluster map and publishes a per-worker snapshot on every change (§4.F).
pub struct ClusterManager {
	active: HashMap<Strng, Arc<Cluster>>,
	warming: HashMap<Strng, Warming>,
	static_names: HashSet<Strng>,
	published: ClusterSnapshot,
	snapshot: Arc<ArcSwap<ClusterSnapshot>>,
	callbacks: Arc<ClusterUpdateCallbacksRegistry>,
	on_demand: Arc<OnDemandTable>,
	metrics: Arc<Metrics>,

	primary_pending: HashSet<Strng>,
	secondary_pending: HashSet<Strng>,
	secondary_phase_started: bool,
	primary_ready_cbs: Vec<Box<dyn FnOnce() + Send>>,
	all_ready_cbs: Vec<Box<dyn FnOnce() + Send>>,
}

impl ClusterManager {
	/// `bootstrap_primary` is the statically-configured (non-xDS) cluster set known at startup;
	/// `primary_ready` fires once every one of them has warmed or failed.
	pub fn new(metrics: Arc<Metrics>, bootstrap_primary: Vec<ClusterConfig>) -> Self {
		let mut manager = ClusterManager {
			active: HashMap::new(),
			warming: HashMap::new(),
			static_names: HashSet::new(),
			published: HashMap::new(),
			snapshot: Arc::new(ArcSwap::from_pointee(HashMap::new())),
			callbacks: Arc::new(ClusterUpdateCallbacksRegistry::new()),
			on_demand: Arc::new(OnDemandTable::new()),
			metrics,
			primary_pending: HashSet::new(),
			secondary_pending: HashSet::new(),
			secondary_phase_started: false,
			primary_ready_cbs: Vec::new(),
			all_ready_cbs: Vec::new(),
		};
		for config in bootstrap_primary {
			let name = Strng::from(config.name.as_str());
			manager.static_names.insert(name.clone());
			manager.primary_pending.insert(name.clone());
			manager.warming.insert(name, Warming::new(config));
		}
		manager.promote_ready();
		manager.maybe_fire_primary_ready();
		manager
	}

	/// A cloneable handle to the published snapshot, suitable for handing to a worker thread; it
	/// observes every future publication without the worker touching the manager itself.
	pub fn snapshot_handle(&self) -> Arc<ArcSwap<ClusterSnapshot>> {
		self.snapshot.clone()
	}

	pub fn get_thread_local_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
		self.snapshot.load().get(name).cloned()
	}

	pub fn active_cluster_names(&self) -> HashSet<Strng> {
		self.active.keys().cloned().collect()
	}

	pub fn warming_cluster_names(&self) -> HashSet<Strng> {
		self.warming.keys().cloned().collect()
	}

	pub fn add_cluster_update_callbacks(
		&self,
		callbacks: Arc<dyn ClusterUpdateCallbacks>,
	) -> ClusterUpdateCallbacksHandle {
		self.callbacks.add(callbacks)
	}

	/// Adds or replaces a cluster (the CDS consumer's entry point; §4.F "a cluster added or
	/// updated dynamically enters the warming set"). A replacement keeps the previously active
	/// cluster serving until the new one finishes warming.
	pub fn add_or_update_cluster(&mut self, config: ClusterConfig) {
		let name = Strng::from(config.name.as_str());
		if !self.active.contains_key(&name) && !self.warming.contains_key(&name) {
			if config.is_primary() {
				self.primary_pending.insert(name.clone());
			} else {
				self.secondary_pending.insert(name.clone());
			}
		}
		self.warming.insert(name, Warming::new(config));
		self.promote_ready();
		self.publish();
	}

	/// Applies an endpoint assignment (the EDS consumer's entry point). Matches against whichever
	/// cluster (warming or already active) declares this `eds_service_name`.
	pub fn update_endpoints(&mut self, assignment: ClusterLoadAssignmentConfig) {
		let key = Strng::from(assignment.cluster_name.as_str());
		let mut touched = false;
		for warming in self.warming.values_mut() {
			if warming.config.eds_key() == key {
				warming.endpoints = Some(assignment.endpoints.clone());
				touched = true;
			}
		}
		for cluster in self.active.values_mut() {
			if cluster.config.eds_key() == key {
				*cluster = Arc::new(Cluster::new(cluster.config.clone(), assignment.endpoints.clone()));
				touched = true;
			}
		}
		if touched {
			self.promote_ready();
			self.publish();
		}
	}

	/// Removes a cluster. Static (bootstrap) clusters cannot be removed via xDS (§4.F).
	pub fn remove_cluster(&mut self, name: &Strng) -> anyhow::Result<()> {
		if self.static_names.contains(name) {
			anyhow::bail!("cluster {name} is statically configured and cannot be removed via xDS");
		}
		self.warming.remove(name);
		self.active.remove(name);
		self.primary_pending.remove(name);
		self.secondary_pending.remove(name);
		self.publish();
		Ok(())
	}

	/// Marks `name`'s initial active health-check round complete (§4.F: a cluster leaves the
	/// warming set once "its active health checker, if any, has completed the initial round"). A
	/// cluster configured without an active health checker never waits on this; calling it for a
	/// name that is not warming, or isn't gated on a health check, is a no-op.
	pub fn mark_health_check_done(&mut self, name: &Strng) {
		if let Some(warming) = self.warming.get_mut(name) {
			warming.health_check_done = true;
		}
		self.promote_ready();
		self.publish();
	}

	/// Deterministically fails a pending cluster without promoting it, so it still counts toward
	/// the primary/secondary readiness callbacks (§4.F: "or failed deterministically").
	pub fn fail_cluster(&mut self, name: &Strng) {
		self.warming.remove(name);
		let was_primary = self.primary_pending.remove(name);
		let was_secondary = self.secondary_pending.remove(name);
		self.metrics.update_failure.inc();
		if was_primary {
			self.maybe_fire_primary_ready();
		}
		if was_secondary {
			self.maybe_fire_all_ready();
		}
	}

	/// Starts the secondary (xDS-sourced) initialization phase with the currently known secondary
	/// cluster names; called by the owner once `primary_ready` has fired (§4.F).
	pub fn begin_secondary_phase(&mut self, secondary_names: HashSet<Strng>) {
		self.secondary_phase_started = true;
		self.secondary_pending.extend(secondary_names);
		self.maybe_fire_all_ready();
	}

	pub fn set_primary_clusters_initialized_cb(&mut self, cb: Box<dyn FnOnce() + Send>) {
		if self.primary_pending.is_empty() {
			cb();
		} else {
			self.primary_ready_cbs.push(cb);
		}
	}

	pub fn set_initialized_cb(&mut self, cb: Box<dyn FnOnce() + Send>) {
		if self.secondary_phase_started && self.secondary_pending.is_empty() {
			cb();
		} else {
			self.all_ready_cbs.push(cb);
		}
	}

	/// On-demand cluster discovery (§4.G). Returns `None` if the cluster already exists (the
	/// caller's callback has already been invoked synchronously with `Available`); otherwise
	/// returns a handle plus whether this is the first pending waiter for `name` (the caller
	/// should forward a discovery request to the control plane only on a fresh name).
	pub fn request_on_demand_cluster_discovery(
		&self,
		name: Strng,
		callback: Arc<dyn Fn(ClusterDiscoveryStatus) + Send + Sync>,
	) -> Option<(ClusterDiscoveryCallbackHandle, bool)> {
		if self.active.contains_key(&name) {
			callback(ClusterDiscoveryStatus::Available);
			return None;
		}
		let is_first = !self.on_demand.has_waiters(&name);
		Some((self.on_demand.register(name, callback), is_first))
	}

	fn promote_ready(&mut self) {
		let ready_names: Vec<Strng> = self
			.warming
			.iter()
			.filter(|(_, w)| w.ready())
			.map(|(n, _)| n.clone())
			.collect();
		for name in ready_names {
			let warming = self.warming.remove(&name).expect("just matched");
			let is_primary = warming.config.is_primary();
			let cluster = Arc::new(Cluster::new(warming.config, warming.endpoints.unwrap_or_default()));
			self.active.insert(name.clone(), cluster);
			self.metrics.update_success.inc();
			if is_primary {
				self.primary_pending.remove(&name);
			} else {
				self.secondary_pending.remove(&name);
			}
		}
		self.maybe_fire_primary_ready();
		self.maybe_fire_all_ready();
	}

	fn maybe_fire_primary_ready(&mut self) {
		if self.primary_pending.is_empty() {
			for cb in self.primary_ready_cbs.drain(..) {
				cb();
			}
		}
	}

	fn maybe_fire_all_ready(&mut self) {
		if self.secondary_phase_started && self.secondary_pending.is_empty() {
			for cb in self.all_ready_cbs.drain(..) {
				cb();
			}
		}
	}

	/// Builds a fresh snapshot from `active`, swaps it in atomically, and fans the diff against
	/// the previously published snapshot out to registered listeners and on-demand waiters.
	/// Mirrors `StoreUpdater::sync_local`'s `PreviousState` diff-and-swap idiom.
	fn publish(&mut self) {
		let next: ClusterSnapshot = self.active.clone();

		for (name, cluster) in &next {
			let changed = match self.published.get(name) {
				Some(prev) => !Arc::ptr_eq(prev, cluster),
				None => true,
			};
			if changed {
				self.callbacks.notify_add_or_update(cluster);
				self.on_demand.notify(name, ClusterDiscoveryStatus::Available);
			}
		}
		for name in self.published.keys() {
			if !next.contains_key(name) {
				self.callbacks.notify_remove(name);
			}
		}

		self.metrics.active_clusters.set(next.len() as i64);
		self.metrics.warming_clusters.set(self.warming.len() as i64);
		self.published = next.clone();
		self.snapshot.store(Arc::new(next));
	}
}

/// A shareable handle wrapping the manager in a mutex so it can implement [`agent_xds::Handler`]
/// (whose `handle` takes `&self`) and be registered directly against a `GrpcMux` via
/// `agent_xds::handler_validator`, the way `StoreUpdater` registers against its mux in the
/// corpus's discovery store.
#[derive(Clone)]
pub struct ClusterManagerHandle(Arc<Mutex<ClusterManager>>);

impl ClusterManagerHandle {
	pub fn new(manager: ClusterManager) -> Self {
		ClusterManagerHandle(Arc::new(Mutex::new(manager)))
	}

	pub fn lock(&self) -> std::sync::MutexGuard<'_, ClusterManager> {
		self.0.lock().unwrap()
	}
}

impl agent_xds::Handler<ClusterConfig> for ClusterManagerHandle {
	fn handle(&self, updates: Box<&mut dyn Iterator<Item = XdsUpdate<ClusterConfig>>>) -> Result<(), Vec<RejectedConfig>> {
		let mut manager = self.0.lock().unwrap();
		let result = agent_xds::handle_single_resource(updates, |update| match update {
			XdsUpdate::Update(resource) => {
				manager.add_or_update_cluster(resource.resource);
				Ok(())
			},
			XdsUpdate::Remove(name) => manager.remove_cluster(&name),
		});
		if let Err(rejects) = &result {
			manager.metrics.update_rejected.inc_by(rejects.len() as u64);
		}
		result
	}
}

impl agent_xds::Handler<ClusterLoadAssignmentConfig> for ClusterManagerHandle {
	fn handle(
		&self,
		updates: Box<&mut dyn Iterator<Item = XdsUpdate<ClusterLoadAssignmentConfig>>>,
	) -> Result<(), Vec<RejectedConfig>> {
		let mut manager = self.0.lock().unwrap();
		let result = agent_xds::handle_single_resource(updates, |update| match update {
			XdsUpdate::Update(resource) => {
				manager.update_endpoints(resource.resource);
				Ok(())
			},
			XdsUpdate::Remove(_name) => Ok(()),
		});
		if let Err(rejects) = &result {
			manager.metrics.update_rejected.inc_by(rejects.len() as u64);
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::DiscoveryType;

	fn static_cluster(name: &str) -> ClusterConfig {
		ClusterConfig {
			name: name.to_string(),
			discovery_type: DiscoveryType::Static as i32,
			static_endpoints: vec![EndpointConfig { address: "10.0.0.1".into(), port: 80, weight: 1, healthy: true }],
			..Default::default()
		}
	}

	fn eds_cluster(name: &str) -> ClusterConfig {
		ClusterConfig { name: name.to_string(), discovery_type: DiscoveryType::Eds as i32, ..Default::default() }
	}

	fn metrics() -> Arc<Metrics> {
		let mut registry = prometheus_client::registry::Registry::default();
		Arc::new(Metrics::new(&mut registry))
	}

	#[test]
	fn static_bootstrap_cluster_is_immediately_ready() {
		let manager = ClusterManager::new(metrics(), vec![static_cluster("a")]);
		assert!(manager.get_thread_local_cluster("a").is_some());
		assert_eq!(manager.active_cluster_names(), HashSet::from([Strng::from("a")]));
	}

	#[test]
	fn eds_cluster_stays_warming_until_endpoints_arrive() {
		let mut manager = ClusterManager::new(metrics(), vec![]);
		manager.add_or_update_cluster(eds_cluster("b"));
		assert!(manager.get_thread_local_cluster("b").is_none());
		assert!(manager.warming_cluster_names().contains(&Strng::from("b")));

		manager.update_endpoints(ClusterLoadAssignmentConfig {
			cluster_name: "b".into(),
			endpoints: vec![EndpointConfig { address: "10.0.0.2".into(), port: 8080, weight: 1, healthy: true }],
		});
		assert!(manager.get_thread_local_cluster("b").is_some());
		assert!(!manager.warming_cluster_names().contains(&Strng::from("b")));
	}

	#[test]
	fn primary_ready_fires_once_every_primary_resolves() {
		let mut manager = ClusterManager::new(metrics(), vec![static_cluster("a")]);
		let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let fired2 = fired.clone();
		manager.set_primary_clusters_initialized_cb(Box::new(move || {
			fired2.store(true, std::sync::atomic::Ordering::Relaxed);
		}));
		assert!(fired.load(std::sync::atomic::Ordering::Relaxed), "already resolved at registration time");
	}

	#[test]
	fn all_ready_waits_for_secondary_phase_and_every_secondary_cluster() {
		let mut manager = ClusterManager::new(metrics(), vec![]);
		manager.add_or_update_cluster(eds_cluster("b"));
		let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let fired2 = fired.clone();
		manager.set_initialized_cb(Box::new(move || {
			fired2.store(true, std::sync::atomic::Ordering::Relaxed);
		}));
		manager.begin_secondary_phase(HashSet::from([Strng::from("b")]));
		assert!(!fired.load(std::sync::atomic::Ordering::Relaxed), "b has not warmed yet");

		manager.update_endpoints(ClusterLoadAssignmentConfig {
			cluster_name: "b".into(),
			endpoints: vec![EndpointConfig { address: "10.0.0.2".into(), port: 8080, weight: 1, healthy: true }],
		});
		assert!(fired.load(std::sync::atomic::Ordering::Relaxed));
	}

	#[test]
	fn cluster_with_active_health_check_waits_for_mark_health_check_done() {
		let mut manager = ClusterManager::new(metrics(), vec![]);
		manager.add_or_update_cluster(ClusterConfig { has_active_health_check: true, ..static_cluster("a") });
		assert!(manager.get_thread_local_cluster("a").is_none(), "endpoints are present but health check hasn't primed");
		assert!(manager.warming_cluster_names().contains(&Strng::from("a")));

		manager.mark_health_check_done(&Strng::from("a"));
		assert!(manager.get_thread_local_cluster("a").is_some());
		assert!(!manager.warming_cluster_names().contains(&Strng::from("a")));
	}

	#[test]
	fn removing_a_static_cluster_is_rejected() {
		let mut manager = ClusterManager::new(metrics(), vec![static_cluster("a")]);
		assert!(manager.remove_cluster(&Strng::from("a")).is_err());
	}

	#[test]
	fn on_demand_discovery_resolves_immediately_for_an_existing_cluster() {
		let manager = ClusterManager::new(metrics(), vec![static_cluster("a")]);
		let seen = Arc::new(std::sync::Mutex::new(None));
		let seen2 = seen.clone();
		let handle =
			manager.request_on_demand_cluster_discovery(Strng::from("a"), Arc::new(move |s| *seen2.lock().unwrap() = Some(s)));
		assert!(handle.is_none());
		assert_eq!(*seen.lock().unwrap(), Some(ClusterDiscoveryStatus::Available));
	}

	#[test]
	fn rejected_updates_through_the_handler_trait_are_counted() {
		let handle = ClusterManagerHandle::new(ClusterManager::new(metrics(), vec![static_cluster("a")]));
		let mut updates = vec![XdsUpdate::Remove(Strng::from("a"))].into_iter();
		let result = agent_xds::Handler::<ClusterConfig>::handle(&handle, Box::new(&mut updates));
		assert!(result.is_err(), "removing a static cluster is rejected");
		assert_eq!(handle.lock().metrics.update_rejected.get(), 1);
	}

	#[test]
	fn on_demand_discovery_resolves_once_the_cluster_warms() {
		let mut manager = ClusterManager::new(metrics(), vec![]);
		let seen = Arc::new(std::sync::Mutex::new(None));
		let seen2 = seen.clone();
		let (_handle, is_first) =
			manager.request_on_demand_cluster_discovery(Strng::from("b"), Arc::new(move |s| *seen2.lock().unwrap() = Some(s))).unwrap();
		assert!(is_first);
		assert!(seen.lock().unwrap().is_none());

		manager.add_or_update_cluster(static_cluster("b"));
		assert_eq!(*seen.lock().unwrap(), Some(ClusterDiscoveryStatus::Available));
	}
}
