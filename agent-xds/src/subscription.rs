//! The subscription façade (§4.E): adapts the multiplexed core onto the classic pull-style
//! `start(names) / update(names) / stop()` contract that the rest of the corpus expects to
//! program against, instead of making every caller learn the watch/multiplexer machinery.
//!
//! Grounded on `examples/original_source/source/common/config/subscription_factory_impl.cc` (one
//! `Subscription` per type_url/config-source pair, constructed once and torn down on drop) and
//! `src/xds/client.rs`'s `Config::watch`/`Demander` API surface (a scoped handle whose drop
//! unregisters interest).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_core::prelude::*;

use crate::client::{AdsClient, MetadataInjector};
use crate::config_source::ApiConfigSource;
use crate::mux::GrpcMux;
use crate::subscription_state::Variant;
use crate::types::{Resource, XdsResource, XdsUpdate, decode_proto};
use crate::watch_map::{WatchCallbacks, WatchDelivery, WatchId, WatchMap};

/// Consumer-facing delivery contract for one subscription: decoded adds/removals, plus advisory
/// hooks for protocol-level failure and a missed init-fetch deadline. Mirrors
/// `SubscriptionCallbacks::onConfigUpdate`/`onConfigUpdateFailed` from the original, narrowed to
/// what a pull-style consumer actually needs.
pub trait SubscriptionCallbacks<T>: Send + Sync {
	/// Called with every accepted update. A decode failure on one resource is logged and the
	/// resource is dropped from the batch rather than failing the whole delivery (§8: "a single
	/// malformed resource must not prevent delivery of the others").
	fn on_config_update(&self, updates: Vec<XdsUpdate<T>>);

	/// The subscription failed at the protocol level (NACK, stream error). `updates` from before
	/// the failure remain in effect; this is advisory only.
	fn on_failure(&self, _error: &str) {}

	/// The init-fetch deadline elapsed with no response. The watch stays registered.
	fn on_init_fetch_timeout(&self) {}
}

struct Adapter<T, C> {
	callbacks: Arc<C>,
	fetched: Arc<AtomicBool>,
	_marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, C> WatchCallbacks for Adapter<T, C>
where
	T: prost::Message + Default + 'static,
	C: SubscriptionCallbacks<T> + 'static,
{
	fn deliver(&self, update: WatchDelivery) {
		self.fetched.store(true, Ordering::Relaxed);
		let mut updates = Vec::with_capacity(update.added.len() + update.removed.len());
		for r in update.added {
			match decode_resource::<T>(&r) {
				Ok(resource) => updates.push(XdsUpdate::Update(resource)),
				Err(e) => warn!(name = %r.name, error = %e, "dropping malformed xds resource"),
			}
		}
		updates.extend(update.removed.into_iter().map(XdsUpdate::Remove));
		self.callbacks.on_config_update(updates);
	}

	fn on_failure(&self, error: &str) {
		self.fetched.store(true, Ordering::Relaxed);
		self.callbacks.on_failure(error);
	}
}

fn decode_resource<T: prost::Message + Default>(r: &Resource) -> Result<XdsResource<T>, prost::DecodeError> {
	Ok(XdsResource {
		name: Strng::from(r.name.as_str()),
		version: Strng::from(r.version.as_str()),
		resource: decode_proto::<T>(&r.value)?,
	})
}

enum Backing {
	Mux { mux: GrpcMux, type_url: Strng },
	File { watch_map: Arc<Mutex<WatchMap>>, poller: tokio::task::JoinHandle<()> },
	/// A standalone per-cluster xDS source (§6 `{api: {...}}` config source): its own dedicated
	/// `GrpcMux`/`AdsClient` pair rather than the shared ADS singleton, torn down with this
	/// subscription instead of outliving it.
	Api { mux: GrpcMux, type_url: Strng, client_task: tokio::task::JoinHandle<()> },
}

/// A live subscription to one resource set. Dropping it unregisters the watch (and, if it held
/// the last interest in a name, lets the next request drop that name) and cancels any still
/// running init-fetch timer.
pub struct Subscription<T> {
	backing: Backing,
	watch_id: WatchId,
	init_fetch_timer: Option<tokio::task::JoinHandle<()>>,
	_marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Subscription<T>
where
	T: prost::Message + Default + 'static,
{
	/// Starts a subscription multiplexed onto `mux`. `names` empty means wildcard.
	pub fn start<C>(
		mux: &GrpcMux,
		type_url: impl Into<Strng>,
		variant: Variant,
		names: HashSet<Strng>,
		init_fetch_timeout: Duration,
		callbacks: Arc<C>,
	) -> Self
	where
		C: SubscriptionCallbacks<T> + 'static,
	{
		let type_url = type_url.into();
		let fetched = Arc::new(AtomicBool::new(false));
		let adapter = Adapter { callbacks: callbacks.clone(), fetched: fetched.clone(), _marker: std::marker::PhantomData };
		let (type_url, watch_id) = mux.add_watch(type_url, variant, names, Box::new(adapter));
		let init_fetch_timer = Some(spawn_init_fetch_timer(fetched, init_fetch_timeout, callbacks));
		Subscription {
			backing: Backing::Mux { mux: mux.clone(), type_url },
			watch_id,
			init_fetch_timer,
			_marker: std::marker::PhantomData,
		}
	}

	/// Like [`Self::start`], but `prefixes` are namespace prefixes rather than exact resource
	/// names (§8 "Namespace watches"): delivery includes every resource whose name begins with one
	/// of them, tracked with a suffix glob instead of an exact match.
	pub fn start_namespace<C>(
		mux: &GrpcMux,
		type_url: impl Into<Strng>,
		variant: Variant,
		prefixes: HashSet<Strng>,
		init_fetch_timeout: Duration,
		callbacks: Arc<C>,
	) -> Self
	where
		C: SubscriptionCallbacks<T> + 'static,
	{
		let type_url = type_url.into();
		let fetched = Arc::new(AtomicBool::new(false));
		let adapter = Adapter { callbacks: callbacks.clone(), fetched: fetched.clone(), _marker: std::marker::PhantomData };
		let (type_url, watch_id) = mux.add_namespace_watch(type_url, variant, prefixes, Box::new(adapter));
		let init_fetch_timer = Some(spawn_init_fetch_timer(fetched, init_fetch_timeout, callbacks));
		Subscription {
			backing: Backing::Mux { mux: mux.clone(), type_url },
			watch_id,
			init_fetch_timer,
			_marker: std::marker::PhantomData,
		}
	}

	/// Starts a subscription against a standalone per-cluster xDS source (§6 `Api` config source)
	/// rather than the shared ADS multiplexer singleton: opens a dedicated `GrpcMux`/`AdsClient`
	/// pair against `endpoint` (already resolved from `source.cluster_refs` by the caller — this
	/// crate does not itself resolve cluster names to addresses) and drives it for exactly this
	/// subscription's lifetime. `api_type` determines the wire variant (sotw for `Rest`/`Grpc`,
	/// delta for `DeltaGrpc`); REST polling rides the same streaming RPC as `Grpc` since this corpus
	/// carries no standalone HTTP/JSON xDS poller, matching `Grpc`'s wire shape is strictly more
	/// capable than what REST offers.
	pub fn start_api<C>(
		source: ApiConfigSource,
		type_url: impl Into<Strng>,
		names: HashSet<Strng>,
		endpoint: tonic::transport::Endpoint,
		auth: Option<MetadataInjector>,
		callbacks: Arc<C>,
	) -> Self
	where
		C: SubscriptionCallbacks<T> + 'static,
	{
		let type_url = type_url.into();
		let variant = source.api_type.variant();
		let rate_limit = source.rate_limit.clone().unwrap_or_default();
		let mux = GrpcMux::new(rate_limit.max_tokens, rate_limit.fill_rate_per_sec);
		let client = AdsClient::with_endpoint(endpoint, auth, mux.clone());
		let client_task = tokio::spawn(async move {
			if let Err(e) = client.run().await {
				warn!("standalone xds api source stream ended: {e}");
			}
		});

		let fetched = Arc::new(AtomicBool::new(false));
		let adapter = Adapter { callbacks: callbacks.clone(), fetched: fetched.clone(), _marker: std::marker::PhantomData };
		let (type_url, watch_id) = mux.add_watch(type_url, variant, names, Box::new(adapter));
		let init_fetch_timeout = source.request_timeout.max(Duration::from_secs(15));
		let init_fetch_timer = Some(spawn_init_fetch_timer(fetched, init_fetch_timeout, callbacks));
		Subscription {
			backing: Backing::Api { mux, type_url, client_task },
			watch_id,
			init_fetch_timer,
			_marker: std::marker::PhantomData,
		}
	}

	/// Dispatches on `source` to the matching constructor (§6: `subscription_factory_impl.cc`'s
	/// `switch (config_source_specifier_case())`, generalized to this crate's pull-style facade).
	/// `mux`/`ads_variant` are only consulted for [`ConfigSource::Ads`], `poll_interval` only for
	/// [`ConfigSource::Path`], and `resolve_api_endpoint` only for [`ConfigSource::Api`] — it turns
	/// an `ApiConfigSource`'s `cluster_refs` into a connectable endpoint plus optional auth
	/// injector, since this crate has no cluster-name-to-address resolution of its own.
	#[allow(clippy::too_many_arguments)]
	pub fn start_from_source<C>(
		source: crate::config_source::ConfigSource,
		type_url: impl Into<Strng>,
		names: HashSet<Strng>,
		mux: &GrpcMux,
		ads_variant: Variant,
		poll_interval: Duration,
		resolve_api_endpoint: impl FnOnce(&ApiConfigSource) -> anyhow::Result<(tonic::transport::Endpoint, Option<MetadataInjector>)>,
		callbacks: Arc<C>,
	) -> anyhow::Result<Self>
	where
		C: SubscriptionCallbacks<T> + 'static,
	{
		use crate::config_source::ConfigSource;
		let init_fetch_timeout = source.init_fetch_timeout();
		Ok(match source {
			ConfigSource::Ads => Self::start(mux, type_url, ads_variant, names, init_fetch_timeout, callbacks),
			ConfigSource::Path(path) => Self::start_file(path, poll_interval, init_fetch_timeout, callbacks),
			ConfigSource::Api(api) => {
				let (endpoint, auth) = resolve_api_endpoint(&api)?;
				Self::start_api(api, type_url, names, endpoint, auth, callbacks)
			},
		})
	}

	/// Starts a subscription backed by a tailed file instead of the multiplexer (the
	/// filesystem-collection config source of §4.E). The file is polled for content changes; each
	/// change is treated as a full atomic snapshot and run through the same [`WatchMap`] delivery
	/// logic that the multiplexer uses, so deletions (names dropped from the file) are delivered
	/// identically to a sotw removal.
	pub fn start_file<C>(
		path: PathBuf,
		poll_interval: Duration,
		init_fetch_timeout: Duration,
		callbacks: Arc<C>,
	) -> Self
	where
		C: SubscriptionCallbacks<T> + 'static,
	{
		let fetched = Arc::new(AtomicBool::new(false));
		let adapter = Adapter { callbacks: callbacks.clone(), fetched: fetched.clone(), _marker: std::marker::PhantomData };
		let watch_map = Arc::new(Mutex::new(WatchMap::new()));
		let watch_id = watch_map.lock().unwrap().add_watch(HashSet::new(), Box::new(adapter)).0;

		let poller = tokio::spawn(tail_file(path, poll_interval, watch_map.clone()));
		let init_fetch_timer = Some(spawn_init_fetch_timer(fetched, init_fetch_timeout, callbacks));
		Subscription {
			backing: Backing::File { watch_map, poller },
			watch_id,
			init_fetch_timer,
			_marker: std::marker::PhantomData,
		}
	}

	/// Replaces the set of names this subscription is interested in. Empty means wildcard.
	pub fn update(&self, names: HashSet<Strng>) {
		match &self.backing {
			Backing::Mux { mux, type_url } | Backing::Api { mux, type_url, .. } => mux.update_watch(type_url, self.watch_id, names),
			Backing::File { watch_map, .. } => {
				watch_map.lock().unwrap().update_watch(self.watch_id, names);
			},
		}
	}
}

impl<T> Drop for Subscription<T> {
	fn drop(&mut self) {
		if let Some(timer) = self.init_fetch_timer.take() {
			timer.abort();
		}
		match &self.backing {
			Backing::Mux { mux, type_url } => mux.remove_watch(type_url, self.watch_id),
			Backing::File { watch_map, poller } => {
				poller.abort();
				watch_map.lock().unwrap().remove_watch(self.watch_id);
			},
			Backing::Api { mux, type_url, client_task } => {
				mux.remove_watch(type_url, self.watch_id);
				client_task.abort();
			},
		}
	}
}

fn spawn_init_fetch_timer<T, C>(
	fetched: Arc<AtomicBool>,
	timeout: Duration,
	callbacks: Arc<C>,
) -> tokio::task::JoinHandle<()>
where
	T: 'static,
	C: SubscriptionCallbacks<T> + 'static,
{
	tokio::spawn(async move {
		tokio::time::sleep(timeout).await;
		if !fetched.load(Ordering::Relaxed) {
			callbacks.on_init_fetch_timeout();
		}
	})
}

/// A resource as stored in a filesystem-collection config source: a JSON array of these. `value`
/// is the resource's proto-encoded bytes, kept opaque here exactly as the wire path keeps it
/// opaque, so the same [`decode_resource`] path applies regardless of where the bytes came from.
/// Public so a one-shot bootstrap reader (e.g. `agentgateway::state_manager`'s static primary
/// cluster load) can parse the same file shape without duplicating it.
#[derive(serde::Deserialize)]
pub struct FileResource {
	pub name: String,
	pub version: String,
	pub value: Vec<u8>,
}

async fn tail_file(path: PathBuf, poll_interval: Duration, watch_map: Arc<Mutex<WatchMap>>) {
	let mut last_contents: Option<Vec<u8>> = None;
	let mut interval = tokio::time::interval(poll_interval);
	loop {
		interval.tick().await;
		let contents = match tokio::fs::read(&path).await {
			Ok(c) => c,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to read filesystem config source");
				continue;
			},
		};
		if last_contents.as_deref() == Some(contents.as_slice()) {
			continue;
		}
		let entries: Vec<FileResource> = match serde_json::from_slice(&contents) {
			Ok(e) => e,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "failed to parse filesystem config source, ignoring snapshot");
				continue;
			},
		};
		last_contents = Some(contents);
		let resources = entries
			.into_iter()
			.map(|e| Resource {
				name: e.name,
				version: e.version,
				value: e.value,
				type_url: String::new(),
			})
			.collect();
		watch_map.lock().unwrap().deliver_sotw(resources);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex as StdMutex;

	use super::*;
	use crate::mux::GrpcMux;

	#[derive(Default)]
	struct Recorder {
		updates: StdMutex<Vec<Vec<XdsUpdate<prost_types::Struct>>>>,
		timeouts: StdMutex<u32>,
	}

	impl SubscriptionCallbacks<prost_types::Struct> for Recorder {
		fn on_config_update(&self, updates: Vec<XdsUpdate<prost_types::Struct>>) {
			self.updates.lock().unwrap().push(updates);
		}
		fn on_init_fetch_timeout(&self) {
			*self.timeouts.lock().unwrap() += 1;
		}
	}

	#[tokio::test]
	async fn missed_init_fetch_deadline_fires_timeout_but_keeps_watch() {
		let mux = GrpcMux::new(10, 10.0);
		let recorder = Arc::new(Recorder::default());
		let sub = Subscription::<prost_types::Struct>::start(
			&mux,
			"Cluster",
			Variant::Sotw,
			HashSet::new(),
			Duration::from_millis(10),
			recorder.clone(),
		);
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(*recorder.timeouts.lock().unwrap(), 1);
		drop(sub);
	}

	#[tokio::test]
	async fn updating_interest_reaches_the_underlying_watch() {
		let mux = GrpcMux::new(10, 10.0);
		let recorder = Arc::new(Recorder::default());
		let sub = Subscription::<prost_types::Struct>::start(
			&mux,
			"Cluster",
			Variant::Sotw,
			HashSet::from([Strng::from("a")]),
			Duration::from_secs(30),
			recorder,
		);
		sub.update(HashSet::from([Strng::from("b")]));
		// No panic / no-op on an unknown type_url's watch id would indicate a wiring bug; this
		// just exercises the call path end to end.
	}

	#[tokio::test]
	async fn api_config_source_opens_its_own_dedicated_mux() {
		let source = ApiConfigSource {
			api_type: crate::config_source::ApiType::Grpc,
			cluster_refs: vec![Strng::from("xds-grpc")],
			refresh_delay: Duration::from_secs(30),
			request_timeout: Duration::from_secs(1),
			rate_limit: None,
			set_node_on_first_message_only: true,
		};
		// Port 0 never accepts a connection; this exercises construction/drop without depending on
		// a live server, since `AdsClient::run`'s reconnect loop tolerates a connect failure.
		let endpoint = tonic::transport::Endpoint::from_static("http://127.0.0.1:0");
		let recorder = Arc::new(Recorder::default());
		let sub =
			Subscription::<prost_types::Struct>::start_api(source, "Cluster", HashSet::new(), endpoint, None, recorder);
		drop(sub);
	}

	#[tokio::test]
	async fn start_from_source_dispatches_ads_to_the_shared_mux() {
		let mux = GrpcMux::new(10, 10.0);
		let recorder = Arc::new(Recorder::default());
		let sub = Subscription::<prost_types::Struct>::start_from_source(
			crate::config_source::ConfigSource::Ads,
			"Cluster",
			HashSet::new(),
			&mux,
			Variant::Delta,
			Duration::from_secs(1),
			|_api| unreachable!("Ads source never resolves an api endpoint"),
			recorder,
		)
		.unwrap();
		drop(sub);
	}
}
