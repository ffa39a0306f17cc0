// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initializes the global tracing subscriber. Safe to call once per process; later calls are
/// no-ops because `tracing`'s global dispatcher can only be set once.
pub fn init() {
	init_with_filter(None)
}

/// Same as [`init`], but `filter` (when set) is used instead of the `RUST_LOG` environment
/// variable. This is how the process config layer's logging filter directive (SPEC_FULL.md
/// §4.H/§6) takes effect without requiring operators to also set `RUST_LOG`.
pub fn init_with_filter(filter: Option<&str>) {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = match filter {
		Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info")),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(true)
		.with_span_events(FmtSpan::NONE);
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.try_init();
}

pub fn uptime() -> std::time::Duration {
	APPLICATION_START_TIME.elapsed()
}
