// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural diff and merge over twin property trees.
//!
//! Merge semantics: a `null` leaf in a patch removes the matching base
//! key (and its metadata), objects merge recursively, and everything
//! else — scalars and arrays alike — replaces wholesale. Diff is the
//! inverse: `merge(a, diff(a, b))` reproduces `b` modulo metadata.
//!
//! Versions are never synthesized here; callers assign them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::document::{Collection, LAST_UPDATED_KEY, LAST_UPDATED_VERSION_KEY};

/// Merge a patch object into a base object.
///
/// Keys absent from the patch are untouched. A `null` patch value
/// removes the key. Fresh subtrees are inserted with their nulls
/// stripped: there is nothing for those markers to remove.
pub fn merge_maps(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, patch_value) in patch {
        if patch_value.is_null() {
            merged.remove(key);
            continue;
        }
        match (base.get(key), patch_value) {
            (Some(base_value), Value::Object(_)) if base_value.is_object() => {
                merged.insert(key.clone(), merge_value(base_value, patch_value));
            }
            _ => {
                merged.insert(key.clone(), strip_nulls(patch_value));
            }
        }
    }
    merged
}

/// Value-level merge. Two objects merge per [`merge_maps`]; any other
/// combination replaces the base with the (null-stripped) patch.
pub fn merge_value(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            Value::Object(merge_maps(base_map, patch_map))
        }
        _ => strip_nulls(patch),
    }
}

/// Drop null entries from an object tree. Arrays are opaque leaves and
/// pass through untouched.
pub fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Combine two *patches* into one patch equivalent to applying them in
/// order. Unlike [`merge_maps`], null markers are kept: a removal in
/// the second patch must still reach whoever applies the combined one.
pub fn combine_patches(first: &Map<String, Value>, second: &Map<String, Value>) -> Map<String, Value> {
    let mut combined = first.clone();
    for (key, second_value) in second {
        match (first.get(key), second_value) {
            (Some(Value::Object(first_child)), Value::Object(second_child)) => {
                combined.insert(
                    key.clone(),
                    Value::Object(combine_patches(first_child, second_child)),
                );
            }
            _ => {
                combined.insert(key.clone(), second_value.clone());
            }
        }
    }
    combined
}

/// Minimal patch turning `a` into `b`, ignoring metadata.
///
/// Keys in `a` but not `b` map to `null`; nested objects diff
/// recursively with empty sub-diffs omitted; arrays compare as opaque
/// leaves. Returns an empty map when `a` and `b` agree.
pub fn diff_maps(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for key in a.keys() {
        if !b.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, b_value) in b {
        match a.get(key) {
            None => {
                patch.insert(key.clone(), b_value.clone());
            }
            Some(a_value) if a_value == b_value => {}
            Some(Value::Object(a_child)) => {
                if let Value::Object(b_child) = b_value {
                    let nested = diff_maps(a_child, b_child);
                    if !nested.is_empty() {
                        patch.insert(key.clone(), Value::Object(nested));
                    }
                } else {
                    patch.insert(key.clone(), b_value.clone());
                }
            }
            Some(_) => {
                patch.insert(key.clone(), b_value.clone());
            }
        }
    }
    patch
}

/// Merge a patch collection into a base collection: properties per
/// [`merge_maps`], metadata per the override rules below. The result
/// keeps `base.version`; callers assign the new version explicitly.
///
/// Metadata rules: stamps from the patch override the base at matching
/// paths, leaves the patch does not touch keep their prior stamps, and
/// removed keys lose theirs.
pub fn merge_collections(base: &Collection, patch: &Collection) -> Collection {
    Collection {
        version: base.version,
        metadata: merge_metadata(&base.metadata, &patch.metadata, &patch.properties),
        properties: merge_maps(&base.properties, &patch.properties),
    }
}

fn merge_metadata(base: &Value, patch_metadata: &Value, patch_properties: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let patch_map = patch_metadata.as_object();

    // per-level stamps from the patch win
    if let Some(map) = patch_map {
        for stamp in [LAST_UPDATED_KEY, LAST_UPDATED_VERSION_KEY] {
            if let Some(value) = map.get(stamp) {
                merged.insert(stamp.to_string(), value.clone());
            }
        }
    }

    for (key, patch_value) in patch_properties {
        if patch_value.is_null() {
            merged.remove(key);
            continue;
        }
        let child_patch_metadata = patch_map
            .and_then(|m| m.get(key))
            .cloned()
            .unwrap_or(Value::Null);
        match patch_value {
            Value::Object(child_properties) => {
                let child_base = merged.get(key).cloned().unwrap_or(Value::Null);
                merged.insert(
                    key.clone(),
                    merge_metadata(&child_base, &child_patch_metadata, child_properties),
                );
            }
            _ => {
                if !child_patch_metadata.is_null() {
                    merged.insert(key.clone(), child_patch_metadata);
                }
            }
        }
    }

    if merged.is_empty() {
        Value::Null
    } else {
        Value::Object(merged)
    }
}

/// Build a `$metadata` subtree mirroring `properties`, stamping every
/// level with `at` and `version`. Null (removal) entries are skipped:
/// removed keys carry no metadata.
pub fn stamp_metadata(properties: &Map<String, Value>, at: DateTime<Utc>, version: i64) -> Value {
    let timestamp = Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true));
    let mut metadata = Map::new();
    metadata.insert(LAST_UPDATED_KEY.to_string(), timestamp.clone());
    metadata.insert(LAST_UPDATED_VERSION_KEY.to_string(), Value::from(version));

    for (key, value) in properties {
        if value.is_null() {
            continue;
        }
        match value {
            Value::Object(child) => {
                metadata.insert(key.clone(), stamp_metadata(child, at, version));
            }
            _ => {
                let mut leaf = Map::new();
                leaf.insert(LAST_UPDATED_KEY.to_string(), timestamp.clone());
                leaf.insert(LAST_UPDATED_VERSION_KEY.to_string(), Value::from(version));
                metadata.insert(key.clone(), Value::Object(leaf));
            }
        }
    }
    Value::Object(metadata)
}
