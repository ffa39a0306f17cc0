//! Shared helpers for building a process-wide [`prometheus_client`] registry with namespaced
//! sub-registries per subsystem, mirroring the corpus's `mtrcs`/`xds::metrics` split.

use prometheus_client::registry::Registry;

/// Creates a sub-registry under `prefix` and hands it to `register`, returning whatever metrics
/// struct `register` builds. This is the same pattern `agent_xds::Metrics::new` and
/// `agent_cluster::Metrics::new` are called with from application wiring.
pub fn sub_registry<T>(registry: &mut Registry, prefix: &'static str, register: impl FnOnce(&mut Registry) -> T) -> T {
	let sub = registry.sub_registry_with_prefix(prefix);
	register(sub)
}
