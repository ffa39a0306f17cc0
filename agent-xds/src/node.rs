use std::env;

use crate::types::Node;

/// Builds the xDS `Node` identity from the conventional downward-API environment variables, plus
/// the process's configured `namespace`/`gateway` identity (§6 "process configuration surface").
/// Sent on the first request of a stream (§4.C node-identity elision). `namespace`/`gateway` win
/// over `POD_NAMESPACE`/`GW_NAME` when non-empty, matching the corpus's `node()`, which folds the
/// same two identifiers into both `cluster` and the `ROLE` metadata entry.
pub fn node(namespace: &str, gateway: &str) -> Node {
	let id = env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string());
	let cluster = if gateway.is_empty() { env::var("GW_NAME").unwrap_or_else(|_| "agentgateway".to_string()) } else { gateway.to_string() };
	let ns = if namespace.is_empty() { env::var("POD_NAMESPACE").unwrap_or_default() } else { namespace.to_string() };
	let mut metadata = std::collections::HashMap::new();
	if let Ok(ip) = env::var("INSTANCE_IP") {
		metadata.insert("INSTANCE_IPS".to_string(), ip);
	}
	if !ns.is_empty() {
		metadata.insert("NAMESPACE".to_string(), ns.clone());
	}
	if let Ok(node_name) = env::var("NODE_NAME") {
		metadata.insert("NODE_NAME".to_string(), node_name);
	}
	metadata.insert("ROLE".to_string(), format!("agentgateway~{ns}~{cluster}"));
	Node {
		id,
		cluster,
		metadata,
		locality: None,
		user_agent_name: "agentgateway".to_string(),
		user_agent_version: env!("CARGO_PKG_VERSION").to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn explicit_namespace_and_gateway_win_over_role_metadata() {
		let n = node("ns-a", "gw-a");
		assert_eq!(n.cluster, "gw-a");
		assert_eq!(n.metadata.get("NAMESPACE").map(String::as_str), Some("ns-a"));
		assert_eq!(n.metadata.get("ROLE").map(String::as_str), Some("agentgateway~ns-a~gw-a"));
	}

	#[test]
	fn empty_namespace_and_gateway_fall_back_to_env_defaults() {
		let n = node("", "");
		assert_eq!(n.cluster, "agentgateway");
	}
}
