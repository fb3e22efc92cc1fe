// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable twin store.
//!
//! One store entry per client id holds the full twin. Mutations run
//! under the shared twin lock table; version arbitration for desired
//! patches lives here so the check and the write are atomic.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::lock::KeyedLocks;
use crate::storage::traits::KvStore;

use super::document::{Collection, Twin};
use super::merge::{merge_collections, merge_value, stamp_metadata, strip_nulls};
use super::validation::{encoded_len, ValidationError, MAX_DOC_BYTES, MAX_VERSION};
use super::TwinError;

const TWIN_PREFIX: &str = "twin/";

fn twin_key(id: &str) -> String {
    format!("{TWIN_PREFIX}{id}")
}

/// How a desired-property patch was arbitrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredOutcome {
    /// Merged into the stored twin (or created it).
    Applied,
    /// Version at or below the stored one; dropped.
    Stale { stored: i64, patch: i64 },
    /// Version gap; the caller owns the resync path.
    VersionGap { stored: i64, patch: i64 },
}

/// Durable desired+reported twin state keyed by client id.
pub struct TwinStore {
    store: Arc<dyn KvStore>,
    locks: Arc<KeyedLocks>,
}

impl TwinStore {
    /// `locks` is shared with the manager so compound operations can
    /// hold the same per-id lock around `get`/`put`.
    pub fn new(store: Arc<dyn KvStore>, locks: Arc<KeyedLocks>) -> Self {
        Self { store, locks }
    }

    /// Read the durable twin. Lock-free: single-key reads are atomic.
    pub async fn get(&self, id: &str) -> Result<Option<Twin>, TwinError> {
        match self.store.get(&twin_key(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| TwinError::Codec {
                    id: id.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Atomically replace the durable twin. Callers that need
    /// read-modify-write hold the per-id lock around this.
    pub async fn put(&self, id: &str, twin: &Twin) -> Result<(), TwinError> {
        let bytes = serde_json::to_vec(twin).map_err(|source| TwinError::Codec {
            id: id.to_string(),
            source,
        })?;
        self.store.put(&twin_key(id), bytes).await?;
        Ok(())
    }

    /// Arbitrate and apply a desired-property patch.
    ///
    /// A missing twin is created with the patch as its desired side and
    /// a default reported side. For an existing twin: a patch at or
    /// below the stored version is dropped, the next version merges,
    /// and any other gap is handed back for a full resync.
    pub async fn apply_desired(
        &self,
        id: &str,
        patch: &Collection,
    ) -> Result<DesiredOutcome, TwinError> {
        let _guard = self.locks.acquire(id).await;

        let Some(mut twin) = self.get(id).await? else {
            let desired = Collection {
                version: patch.version,
                metadata: patch.metadata.clone(),
                properties: match strip_nulls(&Value::Object(patch.properties.clone())) {
                    Value::Object(map) => map,
                    _ => Default::default(),
                },
            };
            let twin = Twin::new(desired, Collection::default());
            self.put(id, &twin).await?;
            debug!(id, version = patch.version, "created twin from desired patch");
            return Ok(DesiredOutcome::Applied);
        };

        let stored = twin.properties.desired.version;
        if patch.version <= stored {
            return Ok(DesiredOutcome::Stale {
                stored,
                patch: patch.version,
            });
        }
        if patch.version != stored + 1 {
            return Ok(DesiredOutcome::VersionGap {
                stored,
                patch: patch.version,
            });
        }

        let mut merged = merge_collections(&twin.properties.desired, patch);
        merged.version = patch.version;
        twin.properties.desired = merged;
        self.put(id, &twin).await?;
        debug!(id, version = patch.version, "applied desired patch");
        Ok(DesiredOutcome::Applied)
    }

    /// Merge a validated reported-property patch, bump the reported
    /// version, and stamp metadata for the touched leaves.
    ///
    /// Returns the merged reported collection. A missing twin is
    /// created on the fly. Limits on the *merged* document (size,
    /// version range) are enforced here, before anything is written.
    pub async fn apply_reported(
        &self,
        id: &str,
        patch: &Collection,
    ) -> Result<Collection, TwinError> {
        let _guard = self.locks.acquire(id).await;

        let mut twin = self.get(id).await?.unwrap_or_default();
        let base = &twin.properties.reported;

        let next_version = base.version + 1;
        if next_version > MAX_VERSION {
            return Err(ValidationError::VersionOverflow.into());
        }

        let mut merged = merge_collections(base, patch);
        merged.version = next_version;

        let size = encoded_len(&merged.properties);
        if size > MAX_DOC_BYTES {
            return Err(ValidationError::DocumentTooLarge(size).into());
        }

        let stamps = stamp_metadata(&patch.properties, Utc::now(), next_version);
        merged.metadata = merge_value(&merged.metadata, &stamps);

        twin.properties.reported = merged.clone();
        self.put(id, &twin).await?;
        debug!(id, version = next_version, "applied reported patch");
        Ok(merged)
    }
}
