//! Scoped registrations for cluster-update listeners (§4.F "Callbacks"). Grounded on
//! `cluster_manager.h`'s `ClusterUpdateCallbacks`/`ClusterUpdateCallbacksHandle` pair and
//! `agent_core::readiness::BlockReady`'s Drop-releases-the-registration idiom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agent_core::strng::Strng;

use crate::cluster::Cluster;

/// Fired after a worker installs a new cluster snapshot (§4.F "Callbacks"). `on_add_or_update`
/// fires once per cluster that is new or changed in the snapshot; `on_remove` once per cluster
/// that dropped out of it.
pub trait ClusterUpdateCallbacks: Send + Sync {
	fn on_add_or_update(&self, cluster: Arc<Cluster>);
	fn on_remove(&self, name: &Strng);
}

struct Entry {
	id: u64,
	callbacks: Arc<dyn ClusterUpdateCallbacks>,
}

/// The registry of listeners a [`crate::manager::ClusterManager`] fans a publication out to.
#[derive(Default)]
pub struct ClusterUpdateCallbacksRegistry {
	next_id: AtomicU64,
	entries: Mutex<Vec<Entry>>,
}

impl ClusterUpdateCallbacksRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(self: &Arc<Self>, callbacks: Arc<dyn ClusterUpdateCallbacks>) -> ClusterUpdateCallbacksHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.entries.lock().unwrap().push(Entry { id, callbacks });
		ClusterUpdateCallbacksHandle { registry: self.clone(), id }
	}

	pub fn notify_add_or_update(&self, cluster: &Arc<Cluster>) {
		for entry in self.entries.lock().unwrap().iter() {
			entry.callbacks.on_add_or_update(cluster.clone());
		}
	}

	pub fn notify_remove(&self, name: &Strng) {
		for entry in self.entries.lock().unwrap().iter() {
			entry.callbacks.on_remove(name);
		}
	}

	fn remove(&self, id: u64) {
		self.entries.lock().unwrap().retain(|e| e.id != id);
	}
}

/// Dropping this removes the registration in O(1) (a single `Vec::retain` pass over however many
/// listeners are registered — small and fixed in practice, one per consumer subsystem).
pub struct ClusterUpdateCallbacksHandle {
	registry: Arc<ClusterUpdateCallbacksRegistry>,
	id: u64,
}

impl Drop for ClusterUpdateCallbacksHandle {
	fn drop(&mut self) {
		self.registry.remove(self.id);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex as StdMutex;

	use super::*;
	use crate::cluster::ClusterConfig;

	#[derive(Default)]
	struct Recorder {
		added: StdMutex<Vec<Strng>>,
		removed: StdMutex<Vec<Strng>>,
	}

	impl ClusterUpdateCallbacks for Recorder {
		fn on_add_or_update(&self, cluster: Arc<Cluster>) {
			self.added.lock().unwrap().push(cluster.name.clone());
		}
		fn on_remove(&self, name: &Strng) {
			self.removed.lock().unwrap().push(name.clone());
		}
	}

	fn cluster(name: &str) -> Arc<Cluster> {
		Arc::new(Cluster::new(ClusterConfig { name: name.to_string(), ..Default::default() }, vec![]))
	}

	#[test]
	fn drop_removes_registration() {
		let registry = Arc::new(ClusterUpdateCallbacksRegistry::new());
		let recorder = Arc::new(Recorder::default());
		let handle = registry.add(recorder.clone());

		registry.notify_add_or_update(&cluster("a"));
		assert_eq!(recorder.added.lock().unwrap().as_slice(), [Strng::from("a")]);

		drop(handle);
		registry.notify_add_or_update(&cluster("b"));
		assert_eq!(recorder.added.lock().unwrap().as_slice(), [Strng::from("a")], "no callback after drop");
	}
}
