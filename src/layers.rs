use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::GeoJsonSource;
use crate::error::LiveError;
use crate::fetcher::{FetchOptions, FetcherConfig, GeoJsonFetcher};
use crate::geojson::FeatureCollection;
use crate::merge::{merge, MergeOutcome, UpdateStrategy};
use crate::poller::{PollConfig, Poller, TickFn, TickFuture};
use crate::stream_manager::{StreamCallbacks, StreamManager};
use crate::visibility::VisibilitySignal;

pub type LayerLoadingFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type LayerLoadedFn = Arc<dyn Fn(&str, usize) + Send + Sync>;
pub type LayerErrorFn = Arc<dyn Fn(&str, &LiveError) + Send + Sync>;
pub type LayerUpdatedFn = Arc<dyn Fn(&str, &MergeOutcome) + Send + Sync>;

/// Lifecycle callbacks a consumer hooks into.
#[derive(Clone, Default)]
pub struct LayerCallbacks {
    /// Start of a URL-sourced initial load; not fired for refreshes.
    pub on_data_loading: Option<LayerLoadingFn>,
    /// Once per successful fetch or valid stream message.
    pub on_data_loaded: Option<LayerLoadedFn>,
    pub on_data_error: Option<LayerErrorFn>,
    /// Merged collection plus per-merge deltas for each update.
    pub on_data_updated: Option<LayerUpdatedFn>,
}

struct LayerEntry {
    source: GeoJsonSource,
    data: Arc<Mutex<FeatureCollection>>,
    url: Option<String>,
    has_poll: bool,
    has_stream: bool,
    cancel: CancelToken,
}

/// Everything shared by a layer's refresh paths (poll tick, stream
/// message, manual refresh).
#[derive(Clone)]
struct RefreshRoute {
    layer_id: String,
    fetcher: Arc<GeoJsonFetcher>,
    url: String,
    ttl_override: Option<Duration>,
    cancel: CancelToken,
    data: Arc<Mutex<FeatureCollection>>,
    strategy: UpdateStrategy,
    callbacks: LayerCallbacks,
}

impl RefreshRoute {
    /// Fetch over the network (conditional revalidation does the
    /// freshness work) and merge the result in.
    async fn run(&self) -> Result<(), LiveError> {
        let outcome = self
            .fetcher
            .fetch(
                &self.url,
                FetchOptions {
                    skip_cache: true,
                    ttl_override: self.ttl_override,
                    cancel: Some(self.cancel.clone()),
                    ..FetchOptions::default()
                },
            )
            .await?;
        apply_update(
            &self.layer_id,
            &self.data,
            outcome.payload,
            &self.strategy,
            &self.callbacks,
        )?;
        Ok(())
    }
}

/// Merge an incoming collection into the layer and notify.
fn apply_update(
    layer_id: &str,
    data: &Arc<Mutex<FeatureCollection>>,
    incoming: FeatureCollection,
    strategy: &UpdateStrategy,
    callbacks: &LayerCallbacks,
) -> Result<MergeOutcome, LiveError> {
    let outcome = {
        let mut guard = data.lock().expect("layer data lock poisoned");
        let merged = merge(guard.clone(), incoming, strategy)?;
        *guard = merged.collection.clone();
        merged
    };
    debug!(
        layer = layer_id,
        added = outcome.added,
        updated = outcome.updated,
        removed = outcome.removed,
        total = outcome.total,
        "layer data merged"
    );
    if let Some(on_data_updated) = &callbacks.on_data_updated {
        on_data_updated(layer_id, &outcome);
    }
    if let Some(on_data_loaded) = &callbacks.on_data_loaded {
        on_data_loaded(layer_id, outcome.total);
    }
    Ok(outcome)
}

/// Per-layer orchestrator: owns the fetcher, poller, and stream
/// multiplexer, and binds each layer to at most one poll entry and one
/// stream entry.
pub struct LayerManager {
    fetcher: Arc<GeoJsonFetcher>,
    poller: Arc<Poller>,
    streams: Arc<StreamManager>,
    layers: DashMap<String, Arc<LayerEntry>>,
    callbacks: LayerCallbacks,
}

impl LayerManager {
    pub fn new(config: FetcherConfig, callbacks: LayerCallbacks) -> Self {
        Self {
            fetcher: Arc::new(GeoJsonFetcher::new(config)),
            poller: Arc::new(Poller::new()),
            streams: Arc::new(StreamManager::new()),
            layers: DashMap::new(),
            callbacks,
        }
    }

    /// Like [`LayerManager::new`], wired to a document-visibility
    /// signal so refresh polling suspends while hidden.
    pub fn with_visibility(
        config: FetcherConfig,
        callbacks: LayerCallbacks,
        visibility: &VisibilitySignal,
    ) -> Self {
        Self {
            fetcher: Arc::new(GeoJsonFetcher::new(config)),
            poller: Arc::new(Poller::with_visibility(visibility)),
            streams: Arc::new(StreamManager::new()),
            layers: DashMap::new(),
            callbacks,
        }
    }

    /// Register a layer and bring its data source up: inline data
    /// installs synchronously, a URL is fetched (loading/loaded/error
    /// callbacks), and refresh polling and streaming start if declared.
    pub async fn add_layer(&self, id: &str, source: GeoJsonSource) -> Result<(), LiveError> {
        source.validate()?;

        let entry = Arc::new(LayerEntry {
            url: source.url.clone(),
            data: Arc::new(Mutex::new(FeatureCollection::empty())),
            has_poll: source.url.is_some() && source.refresh_interval().is_some(),
            has_stream: source.stream_config().is_some(),
            cancel: CancelToken::new(),
            source,
        });

        match self.layers.entry(id.to_string()) {
            Entry::Occupied(_) => {
                return Err(LiveError::Misconfiguration(format!(
                    "layer '{}' already exists",
                    id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        self.install_initial_data(id, &entry).await;

        if entry.has_poll {
            self.register_polling(id, &entry)?;
        }
        if entry.has_stream {
            self.register_stream(id, &entry).await;
        }

        info!(layer = id, "layer added");
        Ok(())
    }

    async fn install_initial_data(&self, id: &str, entry: &Arc<LayerEntry>) {
        if let Some(inline) = &entry.source.data {
            *entry.data.lock().expect("layer data lock poisoned") = inline.clone();
            return;
        }
        if let Some(prefetched) = &entry.source.prefetched_data {
            let count = prefetched.len();
            *entry.data.lock().expect("layer data lock poisoned") = prefetched.clone();
            if let Some(on_data_loaded) = &self.callbacks.on_data_loaded {
                on_data_loaded(id, count);
            }
            return;
        }
        let Some(url) = entry.url.clone() else {
            return;
        };

        if let Some(on_data_loading) = &self.callbacks.on_data_loading {
            on_data_loading(id);
        }
        let result = self
            .fetcher
            .fetch(
                &url,
                FetchOptions {
                    ttl_override: entry.source.ttl_override(),
                    skip_cache: !entry.source.cache_enabled(),
                    cancel: Some(entry.cancel.clone()),
                    ..FetchOptions::default()
                },
            )
            .await;
        match result {
            Ok(outcome) => {
                *entry.data.lock().expect("layer data lock poisoned") = outcome.payload;
                if let Some(on_data_loaded) = &self.callbacks.on_data_loaded {
                    on_data_loaded(id, outcome.feature_count);
                }
            }
            // Cancellation here means the layer went away mid-load;
            // stay quiet.
            Err(LiveError::Cancelled) => {}
            Err(err) => {
                warn!(layer = id, error = %err, "initial layer load failed");
                if let Some(on_data_error) = &self.callbacks.on_data_error {
                    on_data_error(id, &err);
                }
            }
        }
    }

    fn refresh_route(&self, id: &str, entry: &Arc<LayerEntry>) -> Result<RefreshRoute, LiveError> {
        let url = entry.url.clone().ok_or_else(|| {
            LiveError::Misconfiguration(format!("layer '{}' has no url to refresh from", id))
        })?;
        Ok(RefreshRoute {
            layer_id: id.to_string(),
            fetcher: Arc::clone(&self.fetcher),
            url,
            ttl_override: entry.source.ttl_override(),
            cancel: entry.cancel.clone(),
            data: Arc::clone(&entry.data),
            strategy: entry.source.update_strategy()?,
            callbacks: self.callbacks.clone(),
        })
    }

    fn register_polling(&self, id: &str, entry: &Arc<LayerEntry>) -> Result<(), LiveError> {
        let interval = entry
            .source
            .refresh_interval()
            .expect("polling registered without an interval");
        let route = self.refresh_route(id, entry)?;

        let tick_route = route.clone();
        let on_tick: TickFn = Arc::new(move || {
            let route = tick_route.clone();
            let fut: TickFuture = Box::pin(async move { route.run().await });
            fut
        });
        let mut config = PollConfig::new(interval, on_tick);
        let error_callbacks = self.callbacks.clone();
        let layer_id = id.to_string();
        config.on_error = Some(Arc::new(move |err: &LiveError| {
            if matches!(err, LiveError::Cancelled) {
                return;
            }
            if let Some(on_data_error) = &error_callbacks.on_data_error {
                on_data_error(&layer_id, err);
            }
        }));

        self.poller.start(&poll_id(id), config)
    }

    async fn register_stream(&self, id: &str, entry: &Arc<LayerEntry>) {
        let Some((kind, stream_config)) = entry.source.stream_config() else {
            return;
        };
        let strategy = match entry.source.update_strategy() {
            Ok(strategy) => strategy,
            Err(err) => {
                // validate() already rejected this; belt and braces.
                warn!(layer = id, error = %err, "stream registration skipped");
                return;
            }
        };

        let data = Arc::clone(&entry.data);
        let data_callbacks = self.callbacks.clone();
        let on_data = Arc::new(move |layer_id: &str, incoming: FeatureCollection| {
            if let Err(err) = apply_update(layer_id, &data, incoming, &strategy, &data_callbacks) {
                warn!(layer = layer_id, error = %err, "stream update failed to merge");
                if let Some(on_data_error) = &data_callbacks.on_data_error {
                    on_data_error(layer_id, &err);
                }
            }
        });
        let error_callbacks = self.callbacks.clone();
        let on_error = Arc::new(move |layer_id: &str, err: &LiveError| {
            if let Some(on_data_error) = &error_callbacks.on_data_error {
                on_data_error(layer_id, err);
            }
        });

        // The stream id doubles as the callback layer id.
        let result = self
            .streams
            .connect(
                id,
                kind,
                stream_config,
                StreamCallbacks {
                    on_data: Some(on_data),
                    on_error: Some(on_error),
                    on_state_change: None,
                },
            )
            .await;
        if let Err(err) = result {
            warn!(layer = id, error = %err, "stream connection failed");
            if let Some(on_data_error) = &self.callbacks.on_data_error {
                on_data_error(id, &err);
            }
        }
    }

    /// Tear a layer down: stop polling, close the stream, cancel any
    /// in-flight fetch, and drop the stored collection.
    pub fn remove_layer(&self, id: &str) -> bool {
        let Some((_, entry)) = self.layers.remove(id) else {
            return false;
        };
        if entry.has_poll {
            self.poller.stop(&poll_id(id));
        }
        if entry.has_stream {
            self.streams.disconnect(id);
        }
        entry.cancel.cancel();
        info!(layer = id, "layer removed");
        true
    }

    /// Suspend refresh polling for a layer.
    pub fn pause_refresh(&self, id: &str) {
        self.poller.pause(&poll_id(id));
    }

    pub fn resume_refresh(&self, id: &str) {
        self.poller.resume(&poll_id(id));
    }

    /// Force a refresh: the poll tick when polling is registered, or a
    /// one-off fetch+merge for URL layers without polling.
    pub async fn refresh_now(&self, id: &str) -> Result<(), LiveError> {
        let entry = self.layers.get(id).map(|e| Arc::clone(&e)).ok_or_else(|| {
            LiveError::Misconfiguration(format!("unknown layer '{}'", id))
        })?;
        if entry.has_poll {
            self.poller.trigger_now(&poll_id(id)).await
        } else {
            self.refresh_route(id, &entry)?.run().await
        }
    }

    /// Close a layer's stream while keeping the layer.
    pub fn disconnect_stream(&self, id: &str) {
        self.streams.disconnect(id);
    }

    /// Current feature collection for a layer.
    pub fn layer_data(&self, id: &str) -> Option<FeatureCollection> {
        self.layers
            .get(id)
            .map(|entry| entry.data.lock().expect("layer data lock poisoned").clone())
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.layers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has_layer(&self, id: &str) -> bool {
        self.layers.contains_key(id)
    }

    pub fn fetcher(&self) -> &Arc<GeoJsonFetcher> {
        &self.fetcher
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    /// Remove every layer and shut the shared machinery down.
    pub fn destroy(&self) {
        for id in self.layer_ids() {
            self.remove_layer(&id);
        }
        self.poller.destroy();
        self.streams.destroy();
        self.fetcher.abort_all();
    }
}

fn poll_id(layer_id: &str) -> String {
    format!("layer:{}", layer_id)
}
