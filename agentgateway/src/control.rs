//! gRPC transport & auth to the control plane (component K, §4.K, ambient). Wraps the `tonic`
//! channel handed to `agent_xds::AdsClient`: `RootCert` builds the TLS trust root, `AuthSource`
//! injects a bearer `Authorization` header (and a cluster-id header) marked sensitive so it never
//! appears in debug logs. This is the only piece of the stack that terminates TLS to a
//! *control-plane* peer, distinct from the data-plane TLS/SDS termination excluded by the
//! top-level non-goals.
//!
//! Grounded on `crates/agentgateway/src/control/mod.rs`'s `RootCert`/`AuthSource` (trimmed: the
//! custom `tower::Service`/HBONE transport plumbing is dropped in favor of handing a plain
//! `tonic::transport::Endpoint` + header-injector straight to `agent_xds::AdsClient`, which already
//! knows how to reconnect one).

use std::path::PathBuf;
use std::sync::Arc;

use agent_xds::client::MetadataInjector;
use secrecy::{ExposeSecret, SecretString};
use tonic::metadata::MetadataValue;
use tonic::transport::{ClientTlsConfig, Endpoint};

/// Installs the process-wide `rustls` crypto provider. Must run once before the first TLS
/// connection is attempted; safe to call more than once (later calls are ignored).
pub fn install_default_crypto_provider() {
	let _ = rustls::crypto::ring::default_provider().install_default();
}

#[derive(Clone, Debug)]
pub enum RootCert {
	/// A PEM file containing the control plane's CA certificate(s).
	File(PathBuf),
	/// A PEM blob supplied inline (e.g. already read from a mounted secret by the caller).
	Static(Arc<Vec<u8>>),
	/// The platform's native root store.
	Default,
}

impl RootCert {
	pub async fn to_tls_config(&self) -> anyhow::Result<ClientTlsConfig> {
		let mut roots = rustls::RootCertStore::empty();
		match self {
			RootCert::File(path) => {
				let pem = tokio::fs::read(path).await.map_err(|e| anyhow::anyhow!("reading {path:?}: {e}"))?;
				let mut reader = std::io::BufReader::new(std::io::Cursor::new(pem));
				let certs = rustls_pemfile::certs(&mut reader)
					.collect::<Result<Vec<_>, _>>()
					.map_err(|e| anyhow::anyhow!("parsing root cert {path:?}: {e}"))?;
				roots.add_parsable_certificates(certs);
			},
			RootCert::Static(pem) => {
				let mut reader = std::io::BufReader::new(std::io::Cursor::new(pem.as_slice()));
				let certs = rustls_pemfile::certs(&mut reader)
					.collect::<Result<Vec<_>, _>>()
					.map_err(|e| anyhow::anyhow!("parsing inline root cert: {e}"))?;
				roots.add_parsable_certificates(certs);
			},
			RootCert::Default => {
				for cert in rustls_native_certs::load_native_certs().certs {
					// A handful of platform roots commonly fail to parse; skip rather than fail startup.
					let _ = roots.add(cert);
				}
			},
		}
		let client_config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
		Ok(ClientTlsConfig::new().rustls_client_config(client_config))
	}
}

#[derive(Clone, Debug)]
pub enum AuthSource {
	/// A JWT stored in a file, refreshed on every (re)connect; cluster id sent alongside it.
	Token(PathBuf, String),
	/// A static token that does not refresh. Its lifetime ought to exceed the process's.
	StaticToken(#[allow(dead_code)] Arc<SecretString>, String),
	None,
}

const AUTHORIZATION: &str = "authorization";
const CLUSTER_ID: &str = "clusterid";

impl AuthSource {
	/// Builds the header values to attach once, at connect time (tonic interceptors are
	/// synchronous, so a file-backed token is read up front rather than per-message; refreshed on
	/// every reconnect since `agent_xds::AdsClient::run` calls this closure's captured state only
	/// once per stream establishment).
	pub async fn header_values(&self) -> anyhow::Result<Option<(MetadataValue<tonic::metadata::Ascii>, MetadataValue<tonic::metadata::Ascii>)>> {
		match self {
			AuthSource::Token(path, cluster_id) => {
				let token = tokio::fs::read(path).await.map_err(|e| anyhow::anyhow!("reading token {path:?}: {e}"))?;
				if token.is_empty() {
					anyhow::bail!("token file {path:?} exists but is empty");
				}
				let mut bearer = b"Bearer ".to_vec();
				bearer.extend_from_slice(&token);
				let mut auth_value = MetadataValue::try_from(bearer)?;
				auth_value.set_sensitive(true);
				let mut cluster_value = MetadataValue::try_from(cluster_id.as_str())?;
				cluster_value.set_sensitive(true);
				Ok(Some((auth_value, cluster_value)))
			},
			AuthSource::StaticToken(token, cluster_id) => {
				let bearer = format!("Bearer {}", token.expose_secret());
				let mut auth_value = MetadataValue::try_from(bearer)?;
				auth_value.set_sensitive(true);
				let mut cluster_value = MetadataValue::try_from(cluster_id.as_str())?;
				cluster_value.set_sensitive(true);
				Ok(Some((auth_value, cluster_value)))
			},
			AuthSource::None => Ok(None),
		}
	}

	/// Builds the [`MetadataInjector`] `agent_xds::AdsClient::with_endpoint` expects. Reads the
	/// token once, eagerly, so a misconfigured token file is a startup error (§7) rather than a
	/// silent unauthenticated connection.
	pub async fn into_injector(self) -> anyhow::Result<Option<MetadataInjector>> {
		let Some((auth, cluster)) = self.header_values().await? else {
			return Ok(None);
		};
		Ok(Some(Arc::new(move |metadata: &mut tonic::metadata::MetadataMap| {
			metadata.insert(AUTHORIZATION, auth.clone());
			metadata.insert(CLUSTER_ID, cluster.clone());
		})))
	}
}

/// Builds the `Endpoint` `agent_xds::AdsClient::with_endpoint` connects (and reconnects) against,
/// with TLS configured per `root_cert` whenever `address` uses `https`.
pub async fn build_endpoint(address: &str, root_cert: &RootCert) -> anyhow::Result<Endpoint> {
	let mut endpoint = Endpoint::from_shared(address.to_string())?;
	if address.starts_with("https://") {
		endpoint = endpoint.tls_config(root_cert.to_tls_config().await?)?;
	}
	Ok(endpoint)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn no_auth_source_yields_no_injector() {
		assert!(AuthSource::None.into_injector().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn missing_token_file_is_a_startup_error() {
		let err = AuthSource::Token(PathBuf::from("/nonexistent/token"), "cid".to_string())
			.into_injector()
			.await
			.unwrap_err();
		assert!(err.to_string().contains("reading token"));
	}

	#[tokio::test]
	async fn static_root_cert_builds_a_tls_config_from_inline_pem() {
		// Not a real CA cert, but well-formed PEM framing is enough for `rustls_pemfile::certs` to
		// yield a DER blob; `add_parsable_certificates` silently skips what it can't parse as X.509
		// rather than erroring, so this only exercises the plumbing, not cert validity.
		let pem = b"-----BEGIN CERTIFICATE-----\nAA==\n-----END CERTIFICATE-----\n".to_vec();
		assert!(RootCert::Static(Arc::new(pem)).to_tls_config().await.is_ok());
	}

	#[tokio::test]
	async fn static_token_builds_a_bearer_header() {
		let source = AuthSource::StaticToken(Arc::new(SecretString::from("sekret")), "cid".to_string());
		let injector = source.into_injector().await.unwrap().unwrap();
		let mut metadata = tonic::metadata::MetadataMap::new();
		injector(&mut metadata);
		assert!(metadata.get(AUTHORIZATION).is_some());
		assert!(metadata.get(CLUSTER_ID).unwrap().is_sensitive());
	}
}
