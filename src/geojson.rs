use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LiveError;

/// A single GeoJSON feature: a geometry plus a free-form property map.
///
/// Geometry is kept as raw JSON; this crate routes features, it does
/// not interpret coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub feature_type: String,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

fn feature_type() -> String {
    "Feature".to_string()
}

impl Feature {
    /// Look up a property value by key.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|props| props.get(key))
    }

    /// Look up a property and coerce it to a number, if possible.
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.property(key).and_then(Value::as_f64)
    }
}

/// The unit of data exchange between the core and its consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub collection_type: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            collection_type: COLLECTION_TYPE.to_string(),
            features,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

const COLLECTION_TYPE: &str = "FeatureCollection";

/// Whether a raw JSON value has the FeatureCollection shape: an object
/// with `type == "FeatureCollection"` and an array `features`.
pub fn is_feature_collection(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(COLLECTION_TYPE)
        && value.get("features").map(Value::is_array).unwrap_or(false)
}

/// Parse a raw JSON value into a typed collection.
pub fn parse_feature_collection(value: Value) -> Result<FeatureCollection, LiveError> {
    if !is_feature_collection(&value) {
        let shape = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("no type field");
        return Err(LiveError::NotGeoJson(format!(
            "expected a FeatureCollection, got {}",
            shape
        )));
    }
    serde_json::from_value(value).map_err(|e| LiveError::NotGeoJson(e.to_string()))
}
