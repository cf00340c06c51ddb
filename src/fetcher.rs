use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ETAG, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheEntry, CacheStats, PayloadCache};
use crate::cancel::CancelToken;
use crate::error::LiveError;
use crate::geojson::{parse_feature_collection, FeatureCollection};
use crate::retry::{RetryExecutor, RetryHooks, RetryPolicy};

/// Default accept header sent with every request.
pub const DEFAULT_ACCEPT: &str = "application/geo+json,application/json";

/// Fetcher-wide configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Total per-attempt budget, connection through body.
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cache_enabled: true,
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-call options and lifecycle callbacks.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub ttl_override: Option<Duration>,
    /// Skip the cache read; the response still lands in the cache.
    pub skip_cache: bool,
    pub cancel: Option<CancelToken>,
    /// Caller-supplied headers; these win over defaults on conflict.
    pub extra_headers: Vec<(String, String)>,
    pub on_start: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(&FeatureCollection, bool) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&LiveError) + Send + Sync>>,
    pub on_retry: Option<Arc<dyn Fn(u32, u64, &LiveError) + Send + Sync>>,
}

/// What a successful fetch hands back.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub payload: FeatureCollection,
    pub from_cache: bool,
    pub feature_count: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FetcherStats {
    pub cache: CacheStats,
    pub active_requests: usize,
    pub network_requests: u64,
}

/// Removes the live-request registration when an attempt scope ends,
/// early return or not.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, CancelToken>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// HTTP GET of GeoJSON with cache lookup, conditional revalidation,
/// retries, timeouts, and cancellation.
pub struct GeoJsonFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
    cache: Mutex<PayloadCache>,
    in_flight: DashMap<String, CancelToken>,
    network_requests: AtomicU64,
}

impl GeoJsonFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build HTTP client");
        let cache = PayloadCache::new(config.cache.clone());
        Self {
            client,
            config,
            cache: Mutex::new(cache),
            in_flight: DashMap::new(),
            network_requests: AtomicU64::new(0),
        }
    }

    /// Fetch a FeatureCollection from `url`.
    ///
    /// A fresh cache hit short-circuits the network entirely; otherwise
    /// the request runs under the retry executor with conditional
    /// headers, and the parsed payload is written back to the cache.
    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchOutcome, LiveError> {
        let started = Instant::now();
        if let Some(on_start) = &options.on_start {
            on_start();
        }

        let result = self.fetch_inner(url, &options).await;
        match &result {
            Ok((payload, from_cache)) => {
                if let Some(on_complete) = &options.on_complete {
                    on_complete(payload, *from_cache);
                }
            }
            Err(err) => {
                if let Some(on_error) = &options.on_error {
                    on_error(err);
                }
            }
        }

        result.map(|(payload, from_cache)| FetchOutcome {
            feature_count: payload.len(),
            payload,
            from_cache,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn fetch_inner(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<(FeatureCollection, bool), LiveError> {
        if self.config.cache_enabled && !options.skip_cache {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            if let Some(entry) = cache.get(url) {
                debug!(url, "serving payload from cache");
                return Ok((entry.payload, true));
            }
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        self.in_flight.insert(url.to_string(), cancel.clone());
        let _guard = InFlightGuard {
            map: &self.in_flight,
            key: url.to_string(),
        };

        let executor = RetryExecutor::new(self.config.retry.clone());
        let forward_retry = |retry: u32, delay_ms: u64, err: &LiveError| {
            if let Some(on_retry) = &options.on_retry {
                on_retry(retry, delay_ms, err);
            }
        };
        let hooks = RetryHooks {
            on_retry: Some(&forward_retry),
            ..RetryHooks::default()
        };

        executor
            .execute(Some(&cancel), hooks, || {
                self.attempt(url, options.ttl_override, &options.extra_headers, &cancel)
            })
            .await
    }

    /// One HTTP attempt: steps 3-10 of the fetch algorithm.
    async fn attempt(
        &self,
        url: &str,
        ttl_override: Option<Duration>,
        extra_headers: &[(String, String)],
        cancel: &CancelToken,
    ) -> Result<(FeatureCollection, bool), LiveError> {
        if cancel.is_cancelled() {
            return Err(LiveError::Cancelled);
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        if self.config.cache_enabled {
            let cache = self.cache.lock().expect("cache lock poisoned");
            for (name, value) in cache.conditional_headers(url).iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping malformed extra header"),
            }
        }

        self.network_requests.fetch_add(1, Ordering::Relaxed);
        let request = self
            .client
            .get(url)
            .headers(headers)
            .timeout(self.config.timeout);

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| LiveError::from_reqwest(&e, url))?,
            () = cancel.cancelled() => return Err(LiveError::Cancelled),
        };

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(url, "304 not modified, reviving cached payload");
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            // The entry can vanish between sending the conditional
            // request and the 304 arriving; that is terminal.
            return cache
                .revive(url)
                .map(|payload| (payload, true))
                .ok_or_else(|| LiveError::HttpStatus {
                    status: 304,
                    url: url.to_string(),
                });
        }

        if !response.status().is_success() {
            return Err(LiveError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let header_str = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_str(ETAG);
        let last_modified = header_str(LAST_MODIFIED);

        let body = tokio::select! {
            res = response.bytes() => res.map_err(|e| LiveError::from_reqwest(&e, url))?,
            () = cancel.cancelled() => return Err(LiveError::Cancelled),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| LiveError::InvalidJson(e.to_string()))?;
        let payload = parse_feature_collection(value)?;

        if self.config.cache_enabled {
            let mut entry = CacheEntry::new(payload.clone());
            entry.ttl_override = ttl_override;
            entry.etag = etag;
            entry.last_modified = last_modified;
            self.cache
                .lock()
                .expect("cache lock poisoned")
                .set(url, entry);
        }

        debug!(url, features = payload.len(), "fetched feature collection");
        Ok((payload, false))
    }

    /// Warm the cache for a URL without caring about the payload.
    pub async fn prefetch(&self, url: &str, ttl: Option<Duration>) -> Result<(), LiveError> {
        self.fetch(
            url,
            FetchOptions {
                ttl_override: ttl,
                ..FetchOptions::default()
            },
        )
        .await
        .map(|_| ())
    }

    /// Drop the cached entry for a URL.
    pub fn invalidate(&self, url: &str) -> bool {
        self.cache.lock().expect("cache lock poisoned").delete(url)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    pub fn stats(&self) -> FetcherStats {
        FetcherStats {
            cache: self.cache.lock().expect("cache lock poisoned").stats(),
            active_requests: self.in_flight.len(),
            network_requests: self.network_requests.load(Ordering::Relaxed),
        }
    }

    /// Cancel the in-flight request for one URL, if any.
    pub fn abort(&self, url: &str) {
        if let Some((_, token)) = self.in_flight.remove(url) {
            token.cancel();
        }
    }

    /// Cancel every in-flight request.
    pub fn abort_all(&self) {
        let urls: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for url in urls {
            if let Some((_, token)) = self.in_flight.remove(&url) {
                token.cancel();
            }
        }
    }
}
