//! Twin document model.
//!
//! A twin has two sides: `desired` (cloud→client configuration) and
//! `reported` (client→cloud status). Each side is a [`Collection`]: a
//! JSON object carrying a monotonically increasing `$version` and a
//! `$metadata` subtree mirroring the property structure, with
//! `$lastUpdated` / `$lastUpdatedVersion` stamps at each level.
//!
//! On the wire and in the store a twin is encoded per the upstream
//! schema: a top-level object with `properties.desired` and
//! `properties.reported`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata stamp: last update time, RFC 3339 UTC.
pub const LAST_UPDATED_KEY: &str = "$lastUpdated";
/// Metadata stamp: version in effect when the leaf last changed.
pub const LAST_UPDATED_VERSION_KEY: &str = "$lastUpdatedVersion";
/// The one `$`-prefixed key allowed inside property trees.
pub const METADATA_KEY: &str = "$metadata";

/// One side of a twin: versioned properties plus a metadata mirror.
///
/// Also the shape of a *patch*: a sparse collection merged into a base,
/// where `null` leaves mark removals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(rename = "$version", default)]
    pub version: i64,

    #[serde(rename = "$metadata", default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,

    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Collection {
    /// Collection with the given properties and no metadata.
    #[must_use]
    pub fn new(version: i64, properties: Map<String, Value>) -> Self {
        Self {
            version,
            metadata: Value::Null,
            properties,
        }
    }

    /// True when the collection carries no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// The two sides of a twin, nested per the upstream schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: Collection,
    #[serde(default)]
    pub reported: Collection,
}

/// Durable shadow document for one device or module.
///
/// Client ids are `<deviceId>` for devices and `<deviceId>/<moduleId>`
/// for modules; twins treat both uniformly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub properties: TwinProperties,
}

impl Twin {
    #[must_use]
    pub fn new(desired: Collection, reported: Collection) -> Self {
        Self {
            properties: TwinProperties { desired, reported },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_wire_shape() {
        let mut properties = Map::new();
        properties.insert("color".into(), json!("blue"));
        let collection = Collection::new(3, properties);

        let encoded = serde_json::to_value(&collection).unwrap();
        assert_eq!(encoded, json!({"$version": 3, "color": "blue"}));
    }

    #[test]
    fn test_collection_roundtrip_with_metadata() {
        let raw = json!({
            "$version": 7,
            "$metadata": {
                "$lastUpdated": "2026-01-04T12:00:00.000Z",
                "$lastUpdatedVersion": 7,
                "color": {
                    "$lastUpdated": "2026-01-04T12:00:00.000Z",
                    "$lastUpdatedVersion": 7
                }
            },
            "color": "blue"
        });

        let collection: Collection = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(collection.version, 7);
        assert_eq!(collection.properties["color"], json!("blue"));
        assert!(collection.metadata.is_object());

        let back = serde_json::to_value(&collection).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_collection_defaults_when_fields_absent() {
        let collection: Collection = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(collection.version, 0);
        assert!(collection.metadata.is_null());
        assert_eq!(collection.properties["a"], json!(1));
    }

    #[test]
    fn test_null_metadata_not_serialized() {
        let collection = Collection::new(1, Map::new());
        let encoded = serde_json::to_string(&collection).unwrap();
        assert!(!encoded.contains("$metadata"));
    }

    #[test]
    fn test_twin_wire_shape() {
        let twin = Twin::default();
        let encoded = serde_json::to_value(&twin).unwrap();
        assert_eq!(
            encoded,
            json!({
                "properties": {
                    "desired": {"$version": 0},
                    "reported": {"$version": 0}
                }
            })
        );
    }

    #[test]
    fn test_twin_roundtrip() {
        let raw = json!({
            "properties": {
                "desired": {"$version": 5, "interval": 30},
                "reported": {"$version": 2, "firmware": "1.4.2"}
            }
        });

        let twin: Twin = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(twin.properties.desired.version, 5);
        assert_eq!(twin.properties.reported.properties["firmware"], json!("1.4.2"));
        assert_eq!(serde_json::to_value(&twin).unwrap(), raw);
    }

    #[test]
    fn test_empty() {
        assert!(Collection::default().is_empty());
        let mut properties = Map::new();
        properties.insert("a".into(), json!(1));
        assert!(!Collection::new(0, properties).is_empty());
    }
}
