//! Process configuration (component H, §4.H / §6 "Process configuration surface"): a YAML file
//! (optional) overlaid with environment variables, each field documented with its env var name.
//!
//! Grounded on `crates/agentgateway/src/config.rs`'s `parse_config`/`parse`/`parse_default`/
//! `parse_duration`/`validate_uri`/`parse_worker_threads`/`get_cpu_count` helpers, trimmed to the
//! fields this crate's `Config` actually carries: xDS control-plane identity/address/auth, the
//! worker thread pool size, the admin/metrics/readiness bind addresses, and the logging filter.
//! Dropped entirely: CA/SPIFFE identity, HTTP/2 window sizing, tracing (OTLP) endpoint config,
//! network/termination-deadline fields — all belong to the data-plane/SDS machinery this crate's
//! non-goals exclude.

use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use agent_xds::config_source::RateLimitSettings;

use crate::control::{AuthSource, RootCert};

/// A bind address: either an explicit `SocketAddr`, or a bare port bound to localhost. Mirrors
/// the corpus's `Address::{SocketAddr, Localhost}` split, which exists so operators can write
/// `ADMIN_ADDR=15000` without specifying loopback explicitly.
#[derive(Clone, Copy, Debug)]
pub enum Address {
	Localhost(bool, u16),
	SocketAddr(SocketAddr),
}

impl Address {
	pub fn new(ipv6_enabled: bool, raw: &str) -> anyhow::Result<Address> {
		if let Ok(sa) = raw.parse::<SocketAddr>() {
			return Ok(Address::SocketAddr(sa));
		}
		let port: u16 = raw
			.parse()
			.map_err(|_| anyhow::anyhow!("invalid bind address {raw:?}: expected host:port or a bare port"))?;
		Ok(Address::Localhost(ipv6_enabled, port))
	}

	pub fn as_socket_addr(&self) -> SocketAddr {
		match self {
			Address::SocketAddr(sa) => *sa,
			Address::Localhost(ipv6, port) => {
				let ip = if *ipv6 { IpAddr::V6(Ipv6Addr::LOCALHOST) } else { IpAddr::V4(Ipv4Addr::LOCALHOST) };
				SocketAddr::new(ip, *port)
			},
		}
	}
}

/// Control-plane identity/address/auth for the process-wide ADS singleton (§9 "one process-wide
/// ADS multiplexer singleton"). `address` is `None` when the process runs off a filesystem
/// config source only.
#[derive(Clone, Debug)]
pub struct XdsConfig {
	pub address: Option<String>,
	pub namespace: String,
	pub gateway: String,
	pub local_config: Option<PathBuf>,
	pub root_cert: RootCert,
	pub auth: AuthSource,
	pub rate_limit: RateLimitSettings,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub xds: XdsConfig,
	pub admin_addr: Address,
	pub stats_addr: Address,
	pub readiness_addr: Address,
	pub num_worker_threads: usize,
	pub log_filter: Option<String>,
}

/// The optional YAML file shape. Every field overlaps 1:1 with an environment variable of the
/// same intent (documented on each `parse` call site below); the env var always wins when both
/// are set, matching the corpus's layering order.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
	xds_address: Option<String>,
	namespace: Option<String>,
	gateway: Option<String>,
	local_xds_path: Option<PathBuf>,
	xds_root_ca: Option<String>,
	xds_auth_token: Option<String>,
	xds_cluster_id: Option<String>,
	admin_addr: Option<String>,
	stats_addr: Option<String>,
	readiness_addr: Option<String>,
	worker_threads: Option<String>,
	log_filter: Option<String>,
	ipv6_enabled: Option<bool>,
}

/// Parses `contents` (empty string if no file was given) as the YAML overlay, then layers
/// environment variables on top, and validates the result into a `Config`. A fatal config error
/// (malformed URI, missing `NAMESPACE`/`GATEWAY` when an xDS address is set) aborts startup (§7).
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let raw: RawConfig = if contents.trim().is_empty() {
		RawConfig::default()
	} else {
		serde_yaml::from_str(contents)?
	};

	let ipv6_enabled = parse::<bool>("IPV6_ENABLED")?.or(raw.ipv6_enabled).unwrap_or(true);

	let address = validate_uri(empty_to_none(parse("XDS_ADDRESS")?.or(raw.xds_address)))?;
	let (namespace, gateway) = if address.is_some() {
		(
			parse("NAMESPACE")?.or(raw.namespace).ok_or_else(|| anyhow::anyhow!("NAMESPACE is required"))?,
			parse("GATEWAY")?.or(raw.gateway).ok_or_else(|| anyhow::anyhow!("GATEWAY is required"))?,
		)
	} else {
		(String::new(), String::new())
	};
	let local_config = parse::<PathBuf>("LOCAL_XDS_PATH")?.or(raw.local_xds_path);

	let root_cert = match empty_to_none(parse::<String>("XDS_ROOT_CA")?.or(raw.xds_root_ca)) {
		Some(path) => RootCert::File(PathBuf::from(path)),
		None => RootCert::Default,
	};
	let cluster_id = parse("XDS_CLUSTER_ID")?.or(raw.xds_cluster_id).unwrap_or_else(|| "agentgateway".to_string());
	let auth = match empty_to_none(parse::<String>("XDS_AUTH_TOKEN")?.or(raw.xds_auth_token)) {
		Some(path) => AuthSource::Token(PathBuf::from(path), cluster_id),
		None => AuthSource::None,
	};

	let admin_addr = parse::<String>("ADMIN_ADDR")?
		.or(raw.admin_addr)
		.map(|a| Address::new(ipv6_enabled, &a))
		.transpose()?
		.unwrap_or(Address::Localhost(ipv6_enabled, 15000));
	let stats_addr = parse::<String>("STATS_ADDR")?
		.or(raw.stats_addr)
		.map(|a| Address::new(ipv6_enabled, &a))
		.transpose()?
		.unwrap_or(Address::Localhost(ipv6_enabled, 15020));
	let readiness_addr = parse::<String>("READINESS_ADDR")?
		.or(raw.readiness_addr)
		.map(|a| Address::new(ipv6_enabled, &a))
		.transpose()?
		.unwrap_or(Address::Localhost(ipv6_enabled, 15021));

	Ok(Config {
		xds: XdsConfig {
			address,
			namespace,
			gateway,
			local_config,
			root_cert,
			auth,
			rate_limit: RateLimitSettings::default(),
		},
		admin_addr,
		stats_addr,
		readiness_addr,
		num_worker_threads: parse_worker_threads(raw.worker_threads)?,
		log_filter: parse::<String>("RUST_LOG")?.or(raw.log_filter),
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {env}={val} ({e})")),
		Err(_) => Ok(None),
	}
}

fn empty_to_none(inp: Option<String>) -> Option<String> {
	inp.filter(|s| !s.is_empty())
}

/// Fails fast on a malformed control-plane URI rather than surfacing it only once the xDS client
/// attempts to connect; defaults to `https://` when no scheme is given.
fn validate_uri(uri_str: Option<String>) -> anyhow::Result<Option<String>> {
	let Some(uri_str) = uri_str else {
		return Ok(None);
	};
	let uri = http::Uri::try_from(&uri_str)?;
	if uri.scheme().is_none() {
		return Ok(Some(format!("https://{uri_str}")));
	}
	Ok(Some(uri_str))
}

/// Supports both a fixed integer and an `N%` percentage of the logical CPU count (respecting a
/// `CPU_LIMIT` downward-API override), matching the corpus's `parse_worker_threads`.
fn parse_worker_threads(raw: Option<String>) -> anyhow::Result<usize> {
	match parse::<String>("WORKER_THREADS")?.or(raw) {
		Some(value) => {
			if let Some(percent_str) = value.strip_suffix('%') {
				let percent: f64 = percent_str.parse().map_err(|e| anyhow::anyhow!("invalid percentage: {e}"))?;
				if percent <= 0.0 || percent > 100.0 {
					anyhow::bail!("percentage must be between 0 and 100");
				}
				let cpu_count = get_cpu_count()? as f64;
				Ok(((cpu_count * percent / 100.0).ceil() as usize).max(1))
			} else {
				value.parse::<usize>().map_err(|e| anyhow::anyhow!("invalid number: {e}"))
			}
		},
		None => get_cpu_count(),
	}
}

fn get_cpu_count() -> anyhow::Result<usize> {
	match parse::<usize>("CPU_LIMIT")? {
		Some(limit) => Ok(limit),
		None => Ok(num_cpus::get()),
	}
}

pub fn load(path: Option<PathBuf>) -> anyhow::Result<Arc<Config>> {
	let contents = match &path {
		Some(p) => std::fs::read_to_string(p).map_err(|e| anyhow::anyhow!("reading config file {p:?}: {e}"))?,
		None => String::new(),
	};
	Ok(Arc::new(parse_config(&contents)?))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_bind_admin_ports_on_loopback() {
		let cfg = parse_config("").unwrap();
		assert_eq!(cfg.admin_addr.as_socket_addr().port(), 15000);
		assert_eq!(cfg.stats_addr.as_socket_addr().port(), 15020);
		assert_eq!(cfg.readiness_addr.as_socket_addr().port(), 15021);
		assert!(cfg.xds.address.is_none());
	}

	#[test]
	fn yaml_xds_address_without_namespace_is_rejected() {
		let err = parse_config("xdsAddress: xds.example.com:443\n").unwrap_err();
		assert!(err.to_string().contains("NAMESPACE"));
	}

	#[test]
	fn yaml_xds_address_gets_https_scheme_by_default() {
		let yaml = "xdsAddress: xds.example.com:443\nnamespace: ns\ngateway: gw\n";
		let cfg = parse_config(yaml).unwrap();
		assert_eq!(cfg.xds.address.as_deref(), Some("https://xds.example.com:443"));
	}

	#[test]
	fn percentage_worker_threads_round_up() {
		// 1 CPU * 50% == 0.5, rounds up to 1; exercised indirectly via get_cpu_count's CPU_LIMIT override.
		unsafe {
			env::set_var("CPU_LIMIT", "3");
		}
		let threads = parse_worker_threads(Some("50%".to_string())).unwrap();
		unsafe {
			env::remove_var("CPU_LIMIT");
		}
		assert_eq!(threads, 2);
	}
}
