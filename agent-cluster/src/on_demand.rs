//! On-demand cluster discovery (component G, §4.G). Grounded on `cluster_manager.h`'s
//! `requestOnDemandClusterDiscovery`/`notifyOnDemandCluster`/`ClusterDiscoveryStatus`.
//!
//! Cancellation safety: the registry holds only a `Weak` reference to each waiter's callback; the
//! returned [`ClusterDiscoveryCallbackHandle`] holds the strong `Arc`. If the handle is dropped
//! before the cluster resolves, the weak reference fails to upgrade and the notification is
//! silently dropped instead of firing into torn-down state — this is what "already-in-flight
//! posts are nullified by a weak reference check" (§5) means in practice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use agent_core::strng::Strng;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClusterDiscoveryStatus {
	Missing,
	Available,
}

type Callback = dyn Fn(ClusterDiscoveryStatus) + Send + Sync;

struct Waiter {
	id: u64,
	callback: Weak<Callback>,
}

/// The main-thread-only wait table of `{name -> pending callbacks}` (§5 "Shared resources").
#[derive(Default)]
pub struct OnDemandTable {
	next_id: AtomicU64,
	waiters: Mutex<HashMap<Strng, Vec<Waiter>>>,
}

impl OnDemandTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers interest in `name`. The caller is expected to have already checked whether the
	/// cluster exists (step 1 of §4.G is the manager's job, not this table's); this only ever
	/// represents the "not yet resolved" half.
	pub fn register(
		self: &Arc<Self>,
		name: Strng,
		callback: Arc<Callback>,
	) -> ClusterDiscoveryCallbackHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self
			.waiters
			.lock()
			.unwrap()
			.entry(name.clone())
			.or_default()
			.push(Waiter { id, callback: Arc::downgrade(&callback) });
		ClusterDiscoveryCallbackHandle { table: self.clone(), name, id, _keep_alive: callback }
	}

	/// Invokes and clears every still-live waiter for `name` with `status`, dropping ones whose
	/// handle was already destroyed.
	pub fn notify(&self, name: &Strng, status: ClusterDiscoveryStatus) {
		let waiters = self.waiters.lock().unwrap().remove(name);
		let Some(waiters) = waiters else { return };
		for waiter in waiters {
			if let Some(callback) = waiter.callback.upgrade() {
				callback(status);
			}
		}
	}

	pub fn has_waiters(&self, name: &Strng) -> bool {
		self.waiters.lock().unwrap().get(name).is_some_and(|w| !w.is_empty())
	}

	fn remove(&self, name: &Strng, id: u64) {
		let mut waiters = self.waiters.lock().unwrap();
		if let Some(list) = waiters.get_mut(name) {
			list.retain(|w| w.id != id);
			if list.is_empty() {
				waiters.remove(name);
			}
		}
	}
}

/// Dropping this cancels the pending discovery request for this particular caller (other callers
/// waiting on the same name are unaffected).
pub struct ClusterDiscoveryCallbackHandle {
	table: Arc<OnDemandTable>,
	name: Strng,
	id: u64,
	_keep_alive: Arc<Callback>,
}

impl Drop for ClusterDiscoveryCallbackHandle {
	fn drop(&mut self) {
		self.table.remove(&self.name, self.id);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex as StdMutex;

	use super::*;

	#[test]
	fn notify_reaches_live_waiters() {
		let table = Arc::new(OnDemandTable::new());
		let seen: Arc<StdMutex<Vec<ClusterDiscoveryStatus>>> = Arc::new(StdMutex::new(Vec::new()));
		let seen2 = seen.clone();
		let _handle = table.register(Strng::from("a"), Arc::new(move |s| seen2.lock().unwrap().push(s)));

		table.notify(&Strng::from("a"), ClusterDiscoveryStatus::Available);
		assert_eq!(seen.lock().unwrap().as_slice(), [ClusterDiscoveryStatus::Available]);
		assert!(!table.has_waiters(&Strng::from("a")), "notify drains the waiter list");
	}

	#[test]
	fn dropped_handle_suppresses_a_pending_notification() {
		let table = Arc::new(OnDemandTable::new());
		let seen: Arc<StdMutex<u32>> = Arc::new(StdMutex::new(0));
		let seen2 = seen.clone();
		let handle = table.register(Strng::from("a"), Arc::new(move |_| *seen2.lock().unwrap() += 1));

		drop(handle);
		table.notify(&Strng::from("a"), ClusterDiscoveryStatus::Available);
		assert_eq!(*seen.lock().unwrap(), 0, "cancelled waiter must not fire");
	}

	#[test]
	fn unresolved_requests_time_out_as_missing() {
		let table = Arc::new(OnDemandTable::new());
		let seen: Arc<StdMutex<Option<ClusterDiscoveryStatus>>> = Arc::new(StdMutex::new(None));
		let seen2 = seen.clone();
		let _handle = table.register(Strng::from("a"), Arc::new(move |s| *seen2.lock().unwrap() = Some(s)));

		table.notify(&Strng::from("a"), ClusterDiscoveryStatus::Missing);
		assert_eq!(*seen.lock().unwrap(), Some(ClusterDiscoveryStatus::Missing));
	}
}
