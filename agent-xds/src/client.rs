//! Drives the process-wide aggregated discovery stream (§4.A + §9 "one process-wide ADS
//! multiplexer singleton"): connects to the control plane over `tonic`, pumps [`GrpcMux`]'s
//! outbound requests onto the wire, and feeds inbound responses back into it.
//!
//! Grounded on `src/xds/client.rs`'s `AdsClient::run`/`run_internal`: a reconnect loop with
//! jittered backoff wrapping a single `DeltaAggregatedResources` bidi stream, generalized to run
//! against the type-erased [`GrpcMux`] instead of a single-purpose handler map.

use std::sync::Arc;
use std::time::Duration;

use agent_core::prelude::*;
use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};

use crate::error::Error;
use crate::mux::{GrpcMux, OutboundRequest};
use crate::types::{AggregatedDiscoveryServiceClient, DeltaDiscoveryRequest, DiscoveryRequest};

/// Polling period for draining [`GrpcMux::next_request`] onto the outbound channel. The token
/// bucket, not this interval, is what actually paces requests; this just needs to be short enough
/// that a freshly-available token is observed promptly.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Injects control-plane auth headers (bearer token, cluster id) into the outer streaming
/// request's metadata once per connection attempt. Built by `agentgateway::control` (component K,
/// §4.K) from the process config's `AuthSource`; kept as a plain closure here so this crate does
/// not need to know about token files or secrecy redaction.
pub type MetadataInjector = Arc<dyn Fn(&mut MetadataMap) + Send + Sync>;

pub struct AdsClient {
	endpoint: Endpoint,
	auth: Option<MetadataInjector>,
	mux: GrpcMux,
}

impl AdsClient {
	/// Plaintext, unauthenticated control-plane connection (the common case for in-cluster xDS).
	pub fn new(address: impl Into<String>, mux: GrpcMux) -> Result<Self, Error> {
		Ok(AdsClient { endpoint: Channel::from_shared(address.into())?, auth: None, mux })
	}

	/// Connects over an already-configured [`Endpoint`] (e.g. with TLS roots installed by
	/// `agentgateway::control::RootCert`), optionally injecting auth headers on every (re)connect.
	pub fn with_endpoint(endpoint: Endpoint, auth: Option<MetadataInjector>, mux: GrpcMux) -> Self {
		AdsClient { endpoint, auth, mux }
	}

	/// Runs the reconnect loop forever. Each iteration establishes one stream and drives it until
	/// it fails or the server closes it; on failure this sleeps for the backoff the rate-limited
	/// stream model computes before retrying, exactly reproducing the teacher's reconnect pacing.
	pub async fn run(self) -> Result<(), Error> {
		loop {
			self.mux.start_connecting();
			match self.run_once().await {
				Ok(()) => {
					info!("xds stream completed cleanly");
				},
				Err(e) => {
					warn!("xds stream error: {e}");
				},
			}
			let backoff = self.mux.on_disconnect();
			tokio::time::sleep(backoff).await;
		}
	}

	/// Opens both the sotw (`StreamAggregatedResources`) and delta (`DeltaAggregatedResources`)
	/// RPCs on one connection and drives them concurrently, so a [`GrpcMux`] with a mix of
	/// `Variant::Sotw` and `Variant::Delta` subscriptions (§4.B: both variants are first-class)
	/// is actually reachable over the wire instead of only the delta half. A single
	/// [`GrpcMux::next_request`] poll may yield either shape; each is routed onto its matching
	/// RPC's outbound channel.
	async fn run_once(&self) -> Result<(), Error> {
		let channel = self.endpoint.clone().connect().await?;
		let mut client =
			AggregatedDiscoveryServiceClient::new(channel).max_decoding_message_size(200 * 1024 * 1024);

		let (delta_tx, delta_rx) = mpsc::channel::<DeltaDiscoveryRequest>(100);
		let delta_outbound = tokio_stream::wrappers::ReceiverStream::new(delta_rx);
		let mut delta_request = tonic::Request::new(delta_outbound);
		if let Some(auth) = &self.auth {
			auth(delta_request.metadata_mut());
		}
		let delta_response = client.delta_aggregated_resources(delta_request).await.map_err(Error::Grpc)?;

		let (sotw_tx, sotw_rx) = mpsc::channel::<DiscoveryRequest>(100);
		let sotw_outbound = tokio_stream::wrappers::ReceiverStream::new(sotw_rx);
		let mut sotw_request = tonic::Request::new(sotw_outbound);
		if let Some(auth) = &self.auth {
			auth(sotw_request.metadata_mut());
		}
		let sotw_response = client.stream_aggregated_resources(sotw_request).await.map_err(Error::Grpc)?;

		self.mux.on_established();
		info!("xds stream established");

		let mut delta_inbound = delta_response.into_inner();
		let mut sotw_inbound = sotw_response.into_inner();
		let mut pump = tokio::time::interval(PUMP_INTERVAL);
		loop {
			tokio::select! {
				_ = pump.tick() => {
					while let Some(req) = self.mux.next_request() {
						match req {
							OutboundRequest::Delta(req) => {
								if delta_tx.send(req).await.is_err() {
									return Err(Error::StreamClosed);
								}
							},
							OutboundRequest::Sotw(req) => {
								if sotw_tx.send(req).await.is_err() {
									return Err(Error::StreamClosed);
								}
							},
						}
					}
				}
				msg = delta_inbound.message() => {
					let Some(msg) = msg.map_err(Error::Grpc)? else {
						return Ok(());
					};
					self.mux.handle_delta_message(msg);
				}
				msg = sotw_inbound.message() => {
					let Some(msg) = msg.map_err(Error::Grpc)? else {
						return Ok(());
					};
					self.mux.handle_sotw_message(msg);
				}
			}
		}
	}
}
