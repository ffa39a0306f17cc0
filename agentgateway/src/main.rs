//! Process entrypoint: parses CLI args, loads the layered config (component H), initializes
//! logging, then hands off to [`agentgateway::app::run`] and waits for termination.
//!
//! Grounded on the corpus's top-level `main` (argument parsing via `clap`, `--file`/`--config`
//! layering, `tracing_subscriber` init, then a call into `app::run(...).wait_termination()`),
//! trimmed to this crate's single `--config` file flag since there's no `--config` (inline bytes)
//! variant needed without a data-plane deployment pattern to justify passing config as an argument.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the YAML config file. All fields may also be set via environment variable; see
	/// `agentgateway::config` for the full list.
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = agentgateway::config::load(args.config)?;

	agent_core::telemetry::init_with_filter(config.log_filter.as_deref());
	agentgateway::control::install_default_crypto_provider();

	let bound = agentgateway::app::run(config).await?;
	bound.wait_termination().await
}
