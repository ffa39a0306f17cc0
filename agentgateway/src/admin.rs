//! The ambient admin & metrics HTTP surface (component J, §4.J): `/metrics`, `/debug/xds`,
//! `/debug/clusters`, `/healthz/ready`.
//!
//! Grounded on `crates/agentgateway/src/mtrcs.rs`'s axum `/metrics` router (`State`, `Router::route`,
//! `prometheus_client::encoding::text::encode`), generalized from a metrics-only router into one
//! that also exposes the xDS/cluster debug dumps and readiness probe this crate's scope adds.
//! Unlike the corpus, which splits `/metrics` onto its own listener from the general admin API,
//! this crate binds all four routes on one `admin_addr` listener — `stats_addr`/`readiness_addr`
//! remain distinct config fields only so an operator can still split them via a reverse proxy in
//! front if desired.

use std::sync::{Arc, Mutex};

use agent_cluster::ClusterManagerHandle;
use agent_core::drain::DrainWatcher;
use agent_core::readiness::Ready;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;

use crate::config::Address;
use crate::state_manager::StateManager;

#[derive(Clone)]
struct AdminState {
	registry: Arc<Mutex<Registry>>,
	ready: Ready,
	cluster_manager: ClusterManagerHandle,
	mux: Option<agent_xds::GrpcMux>,
}

pub fn router(
	registry: Registry,
	ready: Ready,
	state_manager: &StateManager,
) -> Router {
	let state = AdminState {
		registry: Arc::new(Mutex::new(registry)),
		ready,
		cluster_manager: state_manager.cluster_manager.clone(),
		mux: state_manager.mux().cloned(),
	};
	Router::new()
		.route("/metrics", get(metrics_handler))
		.route("/debug/xds", get(debug_xds_handler))
		.route("/debug/clusters", get(debug_clusters_handler))
		.route("/healthz/ready", get(ready_handler))
		.with_state(state)
}

/// Binds `addr` and serves `router` until `drain` signals; matches the graceful-shutdown idiom
/// `agent_core::drain::run_with_drain` drives elsewhere in the workspace, sized down to axum's own
/// `with_graceful_shutdown` since this listener owns no long-lived per-connection state to drain.
pub async fn serve(addr: Address, router: Router, drain: DrainWatcher) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(addr.as_socket_addr())
		.await
		.map_err(|e| anyhow::anyhow!("binding admin listener on {:?}: {e}", addr.as_socket_addr()))?;
	axum::serve(listener, router)
		.with_graceful_shutdown(async move {
			let _handle = drain.wait_for_drain().await;
		})
		.await
		.map_err(|e| anyhow::anyhow!("admin server failed: {e}"))
}

async fn metrics_handler(State(state): State<AdminState>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	let registry = state.registry.lock().expect("registry mutex poisoned");
	encode(&mut buffer, &registry).map_err(|e| {
		tracing::error!("error encoding metrics: {e}");
		StatusCode::INTERNAL_SERVER_ERROR
	})?;
	Ok(buffer)
}

#[derive(Serialize)]
struct XdsDebugResponse {
	connected: bool,
	subscriptions: Vec<SubscriptionDebugJson>,
}

#[derive(Serialize)]
struct SubscriptionDebugJson {
	type_url: String,
	requested_names: Vec<String>,
	known_version: String,
	last_nonce: String,
	paused: bool,
	watch_count: usize,
}

async fn debug_xds_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let Some(mux) = &state.mux else {
		return axum::Json(XdsDebugResponse { connected: false, subscriptions: Vec::new() });
	};
	let subscriptions = mux
		.debug_dump()
		.into_iter()
		.map(|s| SubscriptionDebugJson {
			type_url: s.type_url.to_string(),
			requested_names: s.requested_names.iter().map(ToString::to_string).collect(),
			known_version: s.known_version.to_string(),
			last_nonce: s.last_nonce.to_string(),
			paused: s.paused,
			watch_count: s.watch_count,
		})
		.collect();
	axum::Json(XdsDebugResponse { connected: true, subscriptions })
}

#[derive(Serialize)]
struct ClusterDebugEntry {
	name: String,
	state: &'static str,
}

async fn debug_clusters_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let manager = state.cluster_manager.lock();
	let mut entries: Vec<ClusterDebugEntry> = manager
		.active_cluster_names()
		.into_iter()
		.map(|name| ClusterDebugEntry { name: name.to_string(), state: "active" })
		.collect();
	entries.extend(
		manager
			.warming_cluster_names()
			.into_iter()
			.map(|name| ClusterDebugEntry { name: name.to_string(), state: "warming" }),
	);
	axum::Json(entries)
}

async fn ready_handler(State(state): State<AdminState>) -> impl IntoResponse {
	let pending = state.ready.pending();
	if pending.is_empty() {
		(StatusCode::OK, "ready\n".to_string())
	} else {
		let mut names: Vec<String> = pending.into_iter().collect();
		names.sort();
		(StatusCode::SERVICE_UNAVAILABLE, format!("not ready, pending: {}\n", names.join(", ")))
	}
}

#[cfg(test)]
mod tests {
	use agent_cluster::{ClusterManager, ClusterManagerHandle};
	use axum::body::Body;
	use axum::http::Request;
	use tower::ServiceExt;

	use super::*;

	fn empty_state_manager() -> (Registry, Ready, ClusterManagerHandle) {
		let registry = Registry::default();
		let ready = Ready::new();
		let mut metrics_registry = Registry::default();
		let cluster_manager = ClusterManagerHandle::new(ClusterManager::new(
			Arc::new(agent_cluster::Metrics::new(&mut metrics_registry)),
			vec![],
		));
		(registry, ready, cluster_manager)
	}

	fn test_router(registry: Registry, ready: Ready, cluster_manager: ClusterManagerHandle) -> Router {
		let state = AdminState { registry: Arc::new(Mutex::new(registry)), ready, cluster_manager, mux: None };
		Router::new()
			.route("/metrics", get(metrics_handler))
			.route("/debug/xds", get(debug_xds_handler))
			.route("/debug/clusters", get(debug_clusters_handler))
			.route("/healthz/ready", get(ready_handler))
			.with_state(state)
	}

	#[tokio::test]
	async fn ready_reports_503_with_pending_tasks() {
		let (registry, ready, cluster_manager) = empty_state_manager();
		let _block = ready.register_task("warming up");
		let router = test_router(registry, ready, cluster_manager);
		let response = router.oneshot(Request::builder().uri("/healthz/ready").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn ready_reports_200_once_empty() {
		let (registry, ready, cluster_manager) = empty_state_manager();
		let router = test_router(registry, ready, cluster_manager);
		let response = router.oneshot(Request::builder().uri("/healthz/ready").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn debug_xds_reports_disconnected_with_no_mux() {
		let (registry, ready, cluster_manager) = empty_state_manager();
		let router = test_router(registry, ready, cluster_manager);
		let response = router.oneshot(Request::builder().uri("/debug/xds").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
