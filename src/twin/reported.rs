// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending reported-property queue.
//!
//! A semantic merge buffer between local clients and the cloud: at most
//! one pending patch per client id, with later updates merged into it
//! in arrival order. Drains are coalesced per id and keep null markers
//! intact so removals still reach the cloud.
//!
//! Drain protocol per id:
//! 1. take the pending patch under the id's queue lock
//! 2. push it upstream
//! 3. `Ok` → persist whatever pending state arrived meanwhile;
//!    `Transient` → fold the taken patch back underneath the arrivals
//!    and retry after a fixed backoff; `Permanent` → drop the entry.
//!
//! Persisted at `reported/<id>` whenever nonempty, so unsynced patches
//! survive restarts.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::GatewayConfig;
use crate::lock::KeyedLocks;
use crate::metrics;
use crate::storage::traits::KvStore;

use super::cloud::{CloudSync, ReportedOutcome};
use super::document::Collection;
use super::merge::{combine_patches, merge_value};
use super::TwinError;

const REPORTED_PREFIX: &str = "reported/";

fn reported_key(id: &str) -> String {
    format!("{REPORTED_PREFIX}{id}")
}

#[derive(Default)]
struct PendingState {
    patch: Option<Collection>,
    last_attempt: Option<Instant>,
    in_flight: bool,
}

/// Buffers reported-property patches until the cloud accepts them.
pub struct ReportedQueue {
    store: Arc<dyn KvStore>,
    cloud: Arc<dyn CloudSync>,
    locks: Arc<KeyedLocks>,
    state: DashMap<String, PendingState>,
    sync_interval: Duration,
    backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReportedQueue {
    pub fn new(
        store: Arc<dyn KvStore>,
        cloud: Arc<dyn CloudSync>,
        locks: Arc<KeyedLocks>,
        config: &GatewayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            cloud,
            locks,
            state: DashMap::new(),
            sync_interval: config.reported_sync_interval(),
            backoff: config.reported_backoff(),
            shutdown,
        }
    }

    /// Reload pending patches persisted by a previous run.
    pub async fn restore(&self) -> Result<usize, TwinError> {
        let entries = self.store.iterate(REPORTED_PREFIX).await?;
        let mut restored = 0;
        for (key, bytes) in entries {
            let Some(id) = key.strip_prefix(REPORTED_PREFIX) else {
                continue;
            };
            match serde_json::from_slice::<Collection>(&bytes) {
                Ok(pending) => {
                    self.state.entry(id.to_string()).or_default().patch = Some(pending);
                    restored += 1;
                }
                Err(error) => {
                    warn!(%key, %error, "skipping corrupt pending reported record");
                }
            }
        }
        metrics::set_pending_reported(self.pending_count());
        Ok(restored)
    }

    /// Merge a patch into the client's pending entry and persist it.
    ///
    /// The patch is only acknowledged once the merged entry is durable.
    pub async fn enqueue(&self, id: &str, patch: &Collection) -> Result<(), TwinError> {
        let _guard = self.locks.acquire(id).await;

        let pending = self.state.get(id).and_then(|entry| entry.patch.clone());
        let combined = match pending {
            Some(existing) => Collection {
                version: 0,
                metadata: merge_value(&existing.metadata, &patch.metadata),
                properties: combine_patches(&existing.properties, &patch.properties),
            },
            None => Collection {
                version: 0,
                metadata: patch.metadata.clone(),
                properties: patch.properties.clone(),
            },
        };

        let bytes = serde_json::to_vec(&combined).map_err(|source| TwinError::Codec {
            id: id.to_string(),
            source,
        })?;
        self.store.put(&reported_key(id), bytes).await?;
        self.state.entry(id.to_string()).or_default().patch = Some(combined);

        metrics::set_pending_reported(self.pending_count());
        debug!(id, "reported patch enqueued");
        Ok(())
    }

    /// Schedule an asynchronous drain for `id`, coalescing with any
    /// drain already in flight for the same id.
    pub fn initiate_sync(self: Arc<Self>, id: &str) {
        {
            let mut entry = self.state.entry(id.to_string()).or_default();
            if entry.in_flight {
                return;
            }
            entry.in_flight = true;
        }
        let id = id.to_string();
        tokio::spawn(async move {
            self.drain(&id).await;
        });
    }

    /// Schedule a drain for every id with pending state.
    pub fn sync_all(self: Arc<Self>) {
        let ids: Vec<String> = self
            .state
            .iter()
            .filter(|entry| entry.value().patch.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            Arc::clone(&self).initiate_sync(&id);
        }
    }

    /// Number of ids with a pending patch.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state
            .iter()
            .filter(|entry| entry.value().patch.is_some())
            .count()
    }

    /// Wait until no drain is in flight. Callers bound this with a
    /// grace timeout during shutdown.
    pub async fn quiesce(&self) {
        loop {
            let active = self.state.iter().any(|entry| entry.value().in_flight);
            if !active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn drain(&self, id: &str) {
        loop {
            if let Some(delay) = self.throttle_delay(id) {
                if !self.wait_or_shutdown(delay).await {
                    break;
                }
            }
            let Some(patch) = self.take_pending(id).await else {
                // nothing pending; the flag was released under the lock
                return;
            };
            match self.cloud.update_reported(id, &patch).await {
                ReportedOutcome::Ok => {
                    metrics::record_reported_drain("ok");
                    debug!(id, "reported patch drained upstream");
                    if let Err(error) = self.commit_success(id).await {
                        warn!(id, %error, "failed to clear drained reported record");
                    }
                    if self.try_finish(id).await {
                        return;
                    }
                    // arrivals during the RPC: keep draining
                }
                ReportedOutcome::Transient => {
                    metrics::record_reported_drain("transient");
                    warn!(id, "upstream rejected reported patch transiently, backing off");
                    self.requeue(id, patch).await;
                    if !self.wait_or_shutdown(self.backoff).await {
                        break;
                    }
                }
                ReportedOutcome::Permanent => {
                    metrics::record_reported_drain("permanent");
                    error!(id, "upstream rejected reported patch permanently, dropping it");
                    self.discard(id).await;
                    return;
                }
            }
        }
        // shutdown: pending state stays persisted for the next run
        self.clear_in_flight(id);
        debug!(id, "reported drain stopped by shutdown");
    }

    /// Take the pending patch, stamping the attempt time. Returns
    /// `None` — releasing the in-flight flag — when nothing is pending.
    async fn take_pending(&self, id: &str) -> Option<Collection> {
        let _guard = self.locks.acquire(id).await;
        let mut entry = self.state.get_mut(id)?;
        match entry.patch.take() {
            Some(patch) => {
                entry.last_attempt = Some(Instant::now());
                Some(patch)
            }
            None => {
                entry.in_flight = false;
                None
            }
        }
    }

    /// After a successful push: if no patches arrived during the RPC,
    /// clear the persisted record. Arrivals were persisted by `enqueue`.
    async fn commit_success(&self, id: &str) -> Result<(), TwinError> {
        let _guard = self.locks.acquire(id).await;
        let empty = self
            .state
            .get(id)
            .map(|entry| entry.patch.is_none())
            .unwrap_or(true);
        if empty {
            self.store.remove(&reported_key(id)).await?;
        }
        metrics::set_pending_reported(self.pending_count());
        Ok(())
    }

    /// Exit the drain if nothing is pending, releasing the flag under
    /// the lock so a racing `enqueue` + `initiate_sync` cannot stall.
    async fn try_finish(&self, id: &str) -> bool {
        let _guard = self.locks.acquire(id).await;
        let Some(mut entry) = self.state.get_mut(id) else {
            return true;
        };
        if entry.patch.is_none() {
            entry.in_flight = false;
            true
        } else {
            false
        }
    }

    /// Fold a transiently rejected patch back underneath any arrivals.
    async fn requeue(&self, id: &str, taken: Collection) {
        let _guard = self.locks.acquire(id).await;
        let arrivals = self.state.get(id).and_then(|entry| entry.patch.clone());
        let combined = match arrivals {
            Some(newer) => Collection {
                version: 0,
                metadata: merge_value(&taken.metadata, &newer.metadata),
                properties: combine_patches(&taken.properties, &newer.properties),
            },
            None => taken,
        };
        self.state.entry(id.to_string()).or_default().patch = Some(combined.clone());
        match serde_json::to_vec(&combined) {
            Ok(bytes) => {
                if let Err(error) = self.store.put(&reported_key(id), bytes).await {
                    error!(id, %error, "failed to persist requeued reported patch");
                }
            }
            Err(error) => error!(id, %error, "failed to encode requeued reported patch"),
        }
    }

    /// Drop the pending entry entirely after a permanent rejection.
    async fn discard(&self, id: &str) {
        {
            let _guard = self.locks.acquire(id).await;
            if let Some(mut entry) = self.state.get_mut(id) {
                entry.patch = None;
                entry.in_flight = false;
            }
            if let Err(error) = self.store.remove(&reported_key(id)).await {
                warn!(id, %error, "failed to remove discarded reported record");
            }
        }
        metrics::set_pending_reported(self.pending_count());
    }

    fn clear_in_flight(&self, id: &str) {
        if let Some(mut entry) = self.state.get_mut(id) {
            entry.in_flight = false;
        }
    }

    fn throttle_delay(&self, id: &str) -> Option<Duration> {
        let last = self.state.get(id)?.last_attempt?;
        let elapsed = last.elapsed();
        (elapsed < self.sync_interval).then(|| self.sync_interval - elapsed)
    }

    /// Sleep unless shutdown fires first. Returns false on shutdown.
    async fn wait_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }
}
