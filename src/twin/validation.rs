// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Limits on client-supplied reported-property patches.
//!
//! Rejection happens before any state is touched: an invalid patch is
//! returned to the caller and never acknowledged.

use serde_json::{Map, Value};
use thiserror::Error;

use super::document::METADATA_KEY;

/// Maximum encoded size of a single reported patch.
pub const MAX_PATCH_BYTES: usize = 8 * 1024;
/// Maximum encoded size of the merged reported document.
pub const MAX_DOC_BYTES: usize = 32 * 1024;
/// Maximum object nesting below the reported root.
pub const MAX_DEPTH: usize = 5;
/// Versions are confined to the positive `i32` range.
pub const MAX_VERSION: i64 = i32::MAX as i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reported patch is {0} bytes, limit is {MAX_PATCH_BYTES}")]
    PatchTooLarge(usize),

    #[error("reported patch nests {0} levels deep, limit is {MAX_DEPTH}")]
    TooDeep(usize),

    #[error("key '{0}' uses a reserved '$' prefix")]
    ReservedKey(String),

    #[error("key '{0}' contains a forbidden character")]
    MalformedKey(String),

    #[error("merged reported document would be {0} bytes, limit is {MAX_DOC_BYTES}")]
    DocumentTooLarge(usize),

    #[error("reported version would exceed {MAX_VERSION}")]
    VersionOverflow,
}

/// Validate a reported patch's size, depth, and key syntax.
pub fn validate_reported_patch(properties: &Map<String, Value>) -> Result<(), ValidationError> {
    let size = encoded_len(properties);
    if size > MAX_PATCH_BYTES {
        return Err(ValidationError::PatchTooLarge(size));
    }
    let depth = map_depth(properties);
    if depth > MAX_DEPTH {
        return Err(ValidationError::TooDeep(depth));
    }
    validate_keys(properties)
}

/// Encoded size of an object tree, as persisted.
pub fn encoded_len(properties: &Map<String, Value>) -> usize {
    serde_json::to_string(properties)
        .map(|encoded| encoded.len())
        .unwrap_or(usize::MAX)
}

fn map_depth(properties: &Map<String, Value>) -> usize {
    if properties.is_empty() {
        return 0;
    }
    1 + properties.values().map(value_depth).max().unwrap_or(0)
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => map_depth(map),
        // arrays are opaque leaves
        _ => 0,
    }
}

fn validate_keys(properties: &Map<String, Value>) -> Result<(), ValidationError> {
    for (key, value) in properties {
        if key == METADATA_KEY {
            // stamps inside the metadata mirror legitimately use '$' keys
            continue;
        }
        if key.starts_with('$') {
            return Err(ValidationError::ReservedKey(key.clone()));
        }
        if key
            .chars()
            .any(|c| c == '.' || c == '$' || c == ' ' || c.is_control())
        {
            return Err(ValidationError::MalformedKey(key.clone()));
        }
        if let Value::Object(child) = value {
            validate_keys(child)?;
        }
    }
    Ok(())
}
