use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

use crate::geojson::FeatureCollection;

/// Tuning for the in-memory payload cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction kicks in.
    pub max_size: usize,
    /// Freshness window for entries without a per-entry override.
    pub default_ttl: Duration,
    /// Whether conditional request headers are produced at all.
    pub revalidation_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            default_ttl: Duration::from_secs(300),
            revalidation_enabled: true,
        }
    }
}

/// A cached payload plus the metadata needed to revalidate it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: FeatureCollection,
    pub stored_at: Instant,
    pub ttl_override: Option<Duration>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheEntry {
    pub fn new(payload: FeatureCollection) -> Self {
        Self {
            payload,
            stored_at: Instant::now(),
            ttl_override: None,
            etag: None,
            last_modified: None,
        }
    }

    fn ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl_override.unwrap_or(default_ttl)
    }

    fn is_fresh(&self, default_ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.stored_at) <= self.ttl(default_ttl)
    }
}

/// Monotonic hit/miss counters plus a size snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    /// Rounded percentage; 0 when nothing has been looked up yet.
    pub hit_rate_pct: u32,
}

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

/// TTL+LRU store of fetched payloads, keyed by request URL.
///
/// `get` is the only freshness-enforcing read: stale entries are
/// deleted on access and recorded as misses. `has` is a pure presence
/// check and leaves both statistics and access order alone.
pub struct PayloadCache {
    config: CacheConfig,
    entries: HashMap<String, Slot>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl PayloadCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Fresh entry for the key, promoting it to most-recently-used.
    ///
    /// A present-but-stale entry is deleted and counted as a miss.
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(slot) if slot.entry.is_fresh(self.config.default_ttl, now) => {
                self.tick += 1;
                slot.last_access = self.tick;
                self.hits += 1;
                Some(slot.entry.clone())
            }
            Some(_) => {
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Presence check, decoupled from freshness and statistics.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry, evicting least-recently-used keys
    /// when a new key would exceed capacity.
    pub fn set(&mut self, key: &str, entry: CacheEntry) {
        if !self.entries.contains_key(key) {
            while self.entries.len() >= self.config.max_size.max(1) {
                let Some(victim) = self.lru_key() else { break };
                tracing::debug!(key = %victim, "evicting least-recently-used cache entry");
                self.entries.remove(&victim);
            }
        }
        self.tick += 1;
        self.entries.insert(
            key.to_string(),
            Slot {
                entry,
                last_access: self.tick,
            },
        );
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry and reset statistics.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.tick = 0;
        self.hits = 0;
        self.misses = 0;
    }

    /// Delete all entries past their TTL, returning how many went.
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let default_ttl = self.config.default_ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.entry.is_fresh(default_ttl, now));
        before - self.entries.len()
    }

    /// Promote a key to most-recently-used without touching the entry.
    pub fn touch(&mut self, key: &str) {
        if let Some(slot) = self.entries.get_mut(key) {
            self.tick += 1;
            slot.last_access = self.tick;
        }
    }

    /// Conditional request headers for a present, fresh entry.
    ///
    /// Empty when revalidation is disabled or nothing usable is stored.
    pub fn conditional_headers(&self, key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !self.config.revalidation_enabled {
            return headers;
        }
        let now = Instant::now();
        let Some(slot) = self.entries.get(key) else {
            return headers;
        };
        if !slot.entry.is_fresh(self.config.default_ttl, now) {
            return headers;
        }
        if let Some(etag) = slot.entry.etag.as_deref() {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        if let Some(last_modified) = slot.entry.last_modified.as_deref() {
            if let Ok(value) = HeaderValue::from_str(last_modified) {
                headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
        headers
    }

    /// Bring an entry back to life after a 304: reset its age, promote
    /// it, and hand back the stored payload.
    pub fn revive(&mut self, key: &str) -> Option<FeatureCollection> {
        let slot = self.entries.get_mut(key)?;
        slot.entry.stored_at = Instant::now();
        self.tick += 1;
        slot.last_access = self.tick;
        Some(slot.entry.payload.clone())
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        // Rounded integer percentage; no lookups yet reads as 0.
        let hit_rate_pct = if total == 0 {
            0
        } else {
            ((self.hits * 100 + total / 2) / total) as u32
        };
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            size: self.entries.len(),
            hit_rate_pct,
        }
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(key, _)| key.clone())
    }
}
