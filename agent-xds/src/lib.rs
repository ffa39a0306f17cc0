//! Dynamic configuration subsystem: the xDS multiplexer, per-type subscription state, the
//! many-watchers watch map, and the classic pull-style `Subscription` façade built on top of them.

pub mod ack_queue;
pub mod client;
pub mod config_source;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod node;
pub mod rate_limited_stream;
pub mod subscription;
pub mod subscription_state;
pub mod token_bucket;
pub mod types;
pub mod watch_map;

pub use client::AdsClient;
pub use error::{AdsError, Error, RejectedConfig};
pub use metrics::Metrics;
pub use mux::{GrpcMux, SubscriptionDebug, Validator};
pub use subscription::{FileResource, Subscription, SubscriptionCallbacks};
pub use subscription_state::Variant;
pub use types::{Resource, ResourceKey, XdsResource, XdsUpdate, decode_proto};
pub use watch_map::{WatchCallbacks, WatchDelivery, WatchId};

use std::sync::Arc;

use agent_core::strng::Strng;

/// A sink for a decoded stream of one resource type, applied as a single batch per delivery.
/// Grounded on `crates/agentgateway/src/store/discovery.rs`'s
/// `impl agent_xds::Handler<XdsAddress> for StoreUpdater`: the direct, non-façade integration
/// point for a consumer (like `agent_cluster`'s cluster manager) that wants to register straight
/// against a [`GrpcMux`] via [`handler_validator`] instead of going through [`Subscription`].
pub trait Handler<T>: Send + Sync {
	fn handle(
		&self,
		updates: Box<&mut dyn Iterator<Item = XdsUpdate<T>>>,
	) -> Result<(), Vec<RejectedConfig>>;
}

/// Helper mirroring the corpus's `handle_single_resource`: folds a decode-then-apply closure over
/// an iterator of [`XdsUpdate`]s, collecting per-resource failures instead of aborting on the
/// first one so a single bad resource doesn't NACK resources that would otherwise have applied.
pub fn handle_single_resource<T, F>(
	updates: impl Iterator<Item = XdsUpdate<T>>,
	mut handle_one: F,
) -> Result<(), Vec<RejectedConfig>>
where
	F: FnMut(XdsUpdate<T>) -> anyhow::Result<()>,
{
	let mut rejects = Vec::new();
	for update in updates {
		let name = match &update {
			XdsUpdate::Update(r) => r.name.clone(),
			XdsUpdate::Remove(n) => n.clone(),
		};
		if let Err(e) = handle_one(update) {
			rejects.push(RejectedConfig { name, reason: e });
		}
	}
	if rejects.is_empty() { Ok(()) } else { Err(rejects) }
}

/// Adapts a [`Handler`] into a [`mux::Validator`] suitable for [`GrpcMux::set_validator`]. Each
/// delivery's resources are decoded and handed to the handler as a batch of updates (no
/// removals: a validator only ever sees the `resources` half of a response, never
/// `removed_resources`, so deletions reach the handler through [`Subscription`]'s watch path
/// instead when one is layered on top).
pub fn handler_validator<T, H>(handler: Arc<H>) -> Validator
where
	T: prost::Message + Default + 'static,
	H: Handler<T> + 'static,
{
	Box::new(move |resources: &[Resource]| {
		let mut decoded = Vec::with_capacity(resources.len());
		for r in resources {
			match decode_proto::<T>(&r.value) {
				Ok(resource) => decoded.push(XdsUpdate::Update(XdsResource {
					name: Strng::from(r.name.as_str()),
					version: Strng::from(r.version.as_str()),
					resource,
				})),
				Err(e) => {
					return Err(vec![RejectedConfig { name: Strng::from(r.name.as_str()), reason: e.into() }]);
				},
			}
		}
		let mut iter = decoded.into_iter();
		handler.handle(Box::new(&mut iter))
	})
}
