//! Process bootstrap (component H, §4.H): wires configuration, the dedicated admin worker pool,
//! readiness/drain/shutdown, and the [`crate::state_manager::StateManager`] together, returning a
//! [`Bound`] the binary awaits on until a shutdown signal arrives.
//!
//! Grounded on `crates/agentgateway/src/app.rs`'s `run`/`Bound`/`new_data_plane_pool`, trimmed of
//! everything downstream of dynamic configuration this crate's non-goals exclude (no tracer, no CA
//! client, no HBONE transport, no MCP/UI, no proxy `Gateway`). The one piece of that file's shape
//! kept deliberately is the dedicated multi-threaded Tokio runtime on its own OS thread (§4.H
//! "a worker-thread pool separate from the thread driving the configuration event loop") — here it
//! hosts the admin/metrics/debug/readiness HTTP surface instead of data-plane dispatch, since this
//! crate has no data plane of its own to run on it.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use agent_core::prelude::*;
use agent_core::{drain, metrics, readiness, signal};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;

use crate::Config;
use crate::state_manager::StateManager;

pub async fn run(config: std::sync::Arc<Config>) -> anyhow::Result<Bound> {
	let admin_pool = new_admin_pool(config.num_worker_threads);

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	let ready = readiness::Ready::new();

	let mut registry = Registry::default();
	let cluster_metrics = std::sync::Arc::new(metrics::sub_registry(&mut registry, "cluster", agent_cluster::Metrics::new));
	let xds_metrics = std::sync::Arc::new(metrics::sub_registry(&mut registry, "xds", agent_xds::Metrics::new));

	// StateManager registers its own "cluster primary init" readiness task against `ready` and
	// drops it once bootstrap/primary clusters have resolved (or immediately if there are none).
	let state_manager = StateManager::new(&config.xds, cluster_metrics, xds_metrics, &ready).await?;

	let admin_router = crate::admin::router(registry, ready.clone(), &state_manager);
	let admin_addr = config.admin_addr;
	let admin_drain = drain_rx.clone();
	admin_pool.send(AdminTask {
		fut: Box::pin(async move { crate::admin::serve(admin_addr, admin_router, admin_drain).await }),
	})?;

	Ok(Bound { shutdown, drain_tx, _state_manager: state_manager })
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
	_state_manager: StateManager,
}

impl Bound {
	/// Waits for an explicit shutdown trigger or a process signal, then drains outstanding work
	/// gracefully (the admin server's in-flight requests) before returning.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
		Ok(())
	}
}

struct AdminTask {
	fut: Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>,
}

/// A dedicated multi-threaded runtime on its own OS thread, fed work over an `mpsc` channel the way
/// the corpus's data-plane pool is fed `DataPlaneTask`s — here carrying the admin HTTP server
/// instead, since this crate terminates no data-plane connections of its own.
fn new_admin_pool(num_worker_threads: usize) -> mpsc::Sender<AdminTask> {
	let (tx, rx) = mpsc::channel();

	let span = tracing::span::Span::current();
	thread::spawn(move || {
		let _span = span.enter();
		let runtime = tokio::runtime::Builder::new_multi_thread()
			.worker_threads(num_worker_threads)
			.thread_name_fn(|| {
				static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
				let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
				format!("agentgateway-admin-{id}")
			})
			.enable_all()
			.build()
			.expect("building admin runtime");
		runtime.block_on(
			async move {
				let mut join_set = JoinSet::new();
				let task_iter: mpsc::Iter<AdminTask> = rx.iter();
				for task in task_iter {
					join_set.spawn(task.fut);
				}
				while let Some(join_result) = join_set.join_next().await {
					match join_result {
						Ok(Err(e)) => warn!("admin task failed: {e}"),
						Ok(Ok(())) => {},
						Err(e) => warn!("failed joining admin task: {e}"),
					}
				}
			}
			.in_current_span(),
		);
	});

	tx
}
