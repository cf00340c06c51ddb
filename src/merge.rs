use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::LiveError;
use crate::geojson::{Feature, FeatureCollection};

/// How an incoming collection is combined with the existing one.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateStrategy {
    /// Discard the existing collection entirely.
    Replace,
    /// Upsert by a property key; incoming wins on collision.
    Merge { update_key: String },
    /// Treat incoming features as appended events, bounded by count
    /// and/or age.
    AppendWindow {
        window_size: Option<usize>,
        window_duration: Option<Duration>,
        timestamp_field: Option<String>,
    },
}

/// Per-call deltas; not running totals.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub collection: FeatureCollection,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

/// Combine `existing` and `incoming` under `strategy`.
///
/// Pure except for the wall clock consulted by the append-window age
/// cut. Fails only on a misconfigured strategy.
pub fn merge(
    existing: FeatureCollection,
    incoming: FeatureCollection,
    strategy: &UpdateStrategy,
) -> Result<MergeOutcome, LiveError> {
    merge_at(existing, incoming, strategy, chrono::Utc::now().timestamp_millis())
}

fn merge_at(
    existing: FeatureCollection,
    incoming: FeatureCollection,
    strategy: &UpdateStrategy,
    now_ms: i64,
) -> Result<MergeOutcome, LiveError> {
    match strategy {
        UpdateStrategy::Replace => Ok(replace(existing, incoming)),
        UpdateStrategy::Merge { update_key } => keyed_merge(existing, incoming, update_key),
        UpdateStrategy::AppendWindow {
            window_size,
            window_duration,
            timestamp_field,
        } => Ok(append_window(
            existing,
            incoming,
            *window_size,
            *window_duration,
            timestamp_field.as_deref(),
            now_ms,
        )),
    }
}

fn replace(existing: FeatureCollection, incoming: FeatureCollection) -> MergeOutcome {
    let added = incoming.len();
    let removed = existing.len();
    let total = incoming.len();
    MergeOutcome {
        collection: incoming,
        added,
        updated: 0,
        removed,
        total,
    }
}

/// A feature's merge key, rendered to a stable string. Absent and null
/// keys make the feature unusable for keyed merging.
fn merge_key(feature: &Feature, update_key: &str) -> Option<String> {
    match feature.property(update_key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn keyed_merge(
    existing: FeatureCollection,
    incoming: FeatureCollection,
    update_key: &str,
) -> Result<MergeOutcome, LiveError> {
    if update_key.is_empty() {
        return Err(LiveError::Misconfiguration(
            "merge strategy requires a non-empty update_key".to_string(),
        ));
    }

    // Insertion-ordered mapping: existing features keep their slot,
    // new keys append in arrival order.
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Feature> = HashMap::new();

    for feature in existing.features {
        let Some(key) = merge_key(&feature, update_key) else {
            continue;
        };
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, feature);
    }

    let mut added = 0;
    let mut updated = 0;
    for feature in incoming.features {
        let Some(key) = merge_key(&feature, update_key) else {
            continue;
        };
        if by_key.contains_key(&key) {
            updated += 1;
        } else {
            added += 1;
            order.push(key.clone());
        }
        by_key.insert(key, feature);
    }

    let features: Vec<Feature> = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect();
    let total = features.len();

    Ok(MergeOutcome {
        collection: FeatureCollection::new(features),
        added,
        updated,
        removed: 0,
        total,
    })
}

fn append_window(
    existing: FeatureCollection,
    incoming: FeatureCollection,
    window_size: Option<usize>,
    window_duration: Option<Duration>,
    timestamp_field: Option<&str>,
    now_ms: i64,
) -> MergeOutcome {
    let existing_len = existing.len();
    let incoming_len = incoming.len();

    let mut features = existing.features;
    features.extend(incoming.features);

    if let (Some(duration), Some(field)) = (window_duration, timestamp_field) {
        let cutoff = now_ms as f64 - duration.as_millis() as f64;
        // Features without a numeric timestamp survive the age cut.
        features.retain(|f| f.property_f64(field).map_or(true, |ts| ts >= cutoff));
    }

    if let Some(field) = timestamp_field {
        features.sort_by(|a, b| {
            let ta = a.property_f64(field).unwrap_or(0.0);
            let tb = b.property_f64(field).unwrap_or(0.0);
            tb.total_cmp(&ta)
        });
    }

    if let Some(cap) = window_size {
        if features.len() > cap {
            features.truncate(cap);
        }
    }

    let total = features.len();
    MergeOutcome {
        collection: FeatureCollection::new(features),
        added: incoming_len,
        updated: 0,
        removed: existing_len + incoming_len - total,
        total,
    }
}
