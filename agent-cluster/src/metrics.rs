//! Cluster-scope gauges/counters named in the observability surface (§6), following
//! `agent_xds::metrics::Metrics`'s `Family<Label, Counter>`/`Gauge` registration style.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub struct Metrics {
	pub warming_clusters: Gauge,
	pub active_clusters: Gauge,
	pub update_success: Counter,
	pub update_failure: Counter,
	pub update_rejected: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let warming_clusters = Gauge::default();
		registry.register(
			"warming_clusters",
			"Number of clusters currently in the warming set",
			warming_clusters.clone(),
		);

		let active_clusters = Gauge::default();
		registry.register(
			"active_clusters",
			"Number of clusters in the published snapshot",
			active_clusters.clone(),
		);

		let update_success = Counter::default();
		registry.register(
			"cluster_update_success",
			"Number of successfully applied cluster/endpoint updates",
			update_success.clone(),
		);

		let update_failure = Counter::default();
		registry.register(
			"cluster_update_failure",
			"Number of cluster/endpoint updates that failed to apply",
			update_failure.clone(),
		);

		let update_rejected = Counter::default();
		registry.register(
			"cluster_update_rejected",
			"Number of cluster/endpoint updates rejected during validation",
			update_rejected.clone(),
		);

		Metrics { warming_clusters, active_clusters, update_success, update_failure, update_rejected }
	}
}
