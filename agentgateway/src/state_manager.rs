//! Wires the xDS multiplexer (components A-D) to the cluster manager (components F/G): builds the
//! control-plane [`AdsClient`]/[`GrpcMux`] when an xDS address is configured, registers
//! [`ClusterManagerHandle`] against it for the "Cluster" and "ClusterLoadAssignment" type URLs
//! (§6 normative type URLs), and carries a one-shot filesystem bootstrap of statically-known
//! primary clusters.
//!
//! No corresponding file exists anywhere in the retrieved pack — `crates/agentgateway/src/lib.rs`
//! (which would define the real `StateManager` this glues toward) is absent from the retrieved
//! example pack. This is a fresh port of the orchestration responsibility `app.rs`'s
//! `state_manager::StateManager::new(...).run()` call site implies, built from
//! `agent_cluster::manager`'s primary/secondary phase API and `agent_xds`'s
//! `GrpcMux`/`handler_validator`/`Subscription` machinery.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use agent_cluster::{ClusterConfig, ClusterLoadAssignmentConfig, ClusterManager, ClusterManagerHandle};
use agent_core::prelude::*;
use agent_core::readiness::Ready;
use agent_xds::watch_map::{WatchCallbacks, WatchDelivery};
use agent_xds::{FileResource, GrpcMux, Variant, XdsUpdate, decode_proto};

use crate::config::XdsConfig;
use crate::control;

/// Normative type URLs (§6): this crate only ever subscribes to the two cluster-scoped ones.
const CLUSTER_TYPE_URL: &str = "Cluster";
const ENDPOINT_TYPE_URL: &str = "ClusterLoadAssignment";

/// Forwards only the *removed* half of a delivery into the cluster manager. Additions are applied
/// as a side effect of the [`agent_xds::Validator`] registered via [`agent_xds::handler_validator`]
/// (which only ever sees a response's `resources`, never its `removed_resources` — see
/// `agent_xds::handler_validator`'s doc comment) so this watch exists purely to cover removals,
/// which the corpus's delta wire shape carries as bare names alongside the decoded adds.
struct RemovalForwarder {
	cluster_manager: ClusterManagerHandle,
}

impl WatchCallbacks for RemovalForwarder {
	fn deliver(&self, update: WatchDelivery) {
		let mut manager = self.cluster_manager.lock();
		for name in update.removed {
			// Static bootstrap clusters reject removal; that's correct here too (an xDS-sourced
			// removal of a bootstrap name is a control-plane bug, not something to apply).
			if let Err(e) = manager.remove_cluster(&name) {
				warn!("rejecting xds-sourced cluster removal: {e}");
			}
		}
	}

	fn on_failure(&self, error: &str) {
		warn!("cluster subscription failure: {error}");
	}
}

/// Owns the cluster manager plus (when an xDS address is configured) the multiplexer driving it.
/// Dropping this drops the spawned `AdsClient::run` task along with it.
pub struct StateManager {
	pub cluster_manager: ClusterManagerHandle,
	mux: Option<GrpcMux>,
	ads_task: Option<tokio::task::JoinHandle<()>>,
}

impl StateManager {
	/// Reads any statically-bootstrapped primary clusters from `config.local_config`, then — if
	/// `config.address` is set — connects to the control plane and starts the secondary
	/// (xDS-sourced) initialization phase once every primary cluster has resolved.
	pub async fn new(
		config: &XdsConfig,
		cluster_metrics: Arc<agent_cluster::Metrics>,
		xds_metrics: Arc<agent_xds::Metrics>,
		ready: &Ready,
	) -> anyhow::Result<Self> {
		let bootstrap = match &config.local_config {
			Some(path) => load_bootstrap_clusters(path).await?,
			None => Vec::new(),
		};

		let manager = ClusterManager::new(cluster_metrics, bootstrap);
		let cluster_manager = ClusterManagerHandle::new(manager);

		let primary_task = ready.register_task("cluster primary init");
		let secondary_mgr = cluster_manager.clone();
		cluster_manager.lock().set_primary_clusters_initialized_cb(Box::new(move || {
			drop(primary_task);
			// No CDS-sourced secondary names are known ahead of the stream; they accumulate into
			// `secondary_pending` as "Cluster" updates with a non-static discovery type arrive.
			secondary_mgr.lock().begin_secondary_phase(HashSet::new());
		}));

		let (mux, ads_task) = match config.address.as_deref() {
			Some(address) => {
				let (mux, task) = Self::start_ads(address, config, cluster_manager.clone(), xds_metrics).await?;
				(Some(mux), Some(task))
			},
			None => (None, None),
		};

		Ok(StateManager { cluster_manager, mux, ads_task })
	}

	async fn start_ads(
		address: &str,
		config: &XdsConfig,
		cluster_manager: ClusterManagerHandle,
		xds_metrics: Arc<agent_xds::Metrics>,
	) -> anyhow::Result<(GrpcMux, tokio::task::JoinHandle<()>)> {
		let endpoint = control::build_endpoint(address, &config.root_cert).await?;
		let injector = config.auth.clone().into_injector().await?;

		let mux = GrpcMux::new(config.rate_limit.max_tokens, config.rate_limit.fill_rate_per_sec)
			.with_metrics(xds_metrics)
			.with_identity(&config.namespace, &config.gateway);

		let cluster_handler = Arc::new(cluster_manager.clone());
		mux.set_validator(CLUSTER_TYPE_URL, agent_xds::handler_validator::<ClusterConfig, _>(cluster_handler.clone()));
		mux.set_validator(
			ENDPOINT_TYPE_URL,
			agent_xds::handler_validator::<ClusterLoadAssignmentConfig, _>(cluster_handler),
		);

		let (_, _) = mux.add_watch(
			CLUSTER_TYPE_URL,
			Variant::Delta,
			HashSet::new(),
			Box::new(RemovalForwarder { cluster_manager: cluster_manager.clone() }),
		);
		// ClusterLoadAssignment removals are a no-op in the manager's Handler impl, but the watch
		// is still registered so the multiplexer counts this type_url's interest correctly.
		let (_, _) = mux.add_watch(
			ENDPOINT_TYPE_URL,
			Variant::Delta,
			HashSet::new(),
			Box::new(RemovalForwarder { cluster_manager: cluster_manager.clone() }),
		);

		let client = agent_xds::AdsClient::with_endpoint(endpoint, injector, mux.clone());
		let task = tokio::spawn(async move {
			if let Err(e) = client.run().await {
				error!("ads client exited: {e}");
			}
		});

		Ok((mux, task))
	}

	/// `/debug/xds`'s JSON dump draws on this: whether a control-plane connection was configured
	/// at all.
	pub fn mux(&self) -> Option<&GrpcMux> {
		self.mux.as_ref()
	}
}

impl Drop for StateManager {
	fn drop(&mut self) {
		if let Some(task) = self.ads_task.take() {
			task.abort();
		}
	}
}

/// Reads a one-shot JSON snapshot of statically-known primary clusters (the same
/// `{name, version, value}` shape `agent_xds::Subscription::start_file` tails for live updates),
/// decoding each entry's `value` as a [`ClusterConfig`]. A missing file is not an error — plenty of
/// deployments run purely off the control plane.
async fn load_bootstrap_clusters(path: &Path) -> anyhow::Result<Vec<ClusterConfig>> {
	let contents = match tokio::fs::read(path).await {
		Ok(c) => c,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(anyhow::anyhow!("reading bootstrap clusters {path:?}: {e}")),
	};
	let entries: Vec<FileResource> =
		serde_json::from_slice(&contents).map_err(|e| anyhow::anyhow!("parsing bootstrap clusters {path:?}: {e}"))?;
	entries
		.into_iter()
		.map(|entry| {
			decode_proto::<ClusterConfig>(&entry.value)
				.map_err(|e| anyhow::anyhow!("decoding bootstrap cluster {:?}: {e}", entry.name))
		})
		.collect()
}

/// Applies a decoded batch directly, bypassing the xDS wire path — exercised by tests below and
/// available to `agent_xds::Handler` callers that already hold decoded updates in hand.
#[cfg(test)]
fn apply_for_test(manager: &ClusterManagerHandle, updates: Vec<XdsUpdate<ClusterConfig>>) {
	let mut iter = updates.into_iter();
	let _ = agent_xds::Handler::<ClusterConfig>::handle(manager, Box::new(&mut iter));
}

#[cfg(test)]
mod tests {
	use agent_cluster::DiscoveryType;
	use agent_xds::XdsResource;

	use super::*;

	fn metrics() -> Arc<agent_cluster::Metrics> {
		let mut registry = prometheus_client::registry::Registry::default();
		Arc::new(agent_cluster::Metrics::new(&mut registry))
	}

	#[tokio::test]
	async fn no_xds_address_resolves_readiness_from_bootstrap_alone() {
		let config = XdsConfig {
			address: None,
			namespace: String::new(),
			gateway: String::new(),
			local_config: None,
			root_cert: control::RootCert::Default,
			auth: control::AuthSource::None,
			rate_limit: agent_xds::config_source::RateLimitSettings::default(),
		};
		let ready = Ready::new();
		let xds_metrics = {
			let mut registry = prometheus_client::registry::Registry::default();
			Arc::new(agent_xds::Metrics::new(&mut registry))
		};
		let state_manager = StateManager::new(&config, metrics(), xds_metrics, &ready).await.unwrap();
		assert!(state_manager.mux().is_none());
		assert!(ready.pending().is_empty(), "no bootstrap clusters means nothing to block readiness on");
	}

	#[tokio::test]
	async fn handler_path_applies_cluster_updates_directly() {
		let manager = ClusterManagerHandle::new(ClusterManager::new(metrics(), vec![]));
		apply_for_test(
			&manager,
			vec![XdsUpdate::Update(XdsResource {
				name: Strng::from("a"),
				version: Strng::from("1"),
				resource: ClusterConfig { name: "a".into(), discovery_type: DiscoveryType::Static as i32, ..Default::default() },
			})],
		);
		assert!(manager.lock().active_cluster_names().contains(&Strng::from("a")));
	}

	#[tokio::test]
	async fn missing_bootstrap_file_is_not_an_error() {
		let clusters = load_bootstrap_clusters(Path::new("/nonexistent/bootstrap.json")).await.unwrap();
		assert!(clusters.is_empty());
	}
}
