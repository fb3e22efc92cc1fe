// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted identity scope cache.
//!
//! Mirrors the gateway's authorization scope locally so clients can be
//! authenticated while the identity service is unreachable. A single
//! refresher task alternates between full refresh cycles and waiting on
//! an on-demand signal or the periodic interval, whichever fires first.
//! Targeted lookups run concurrently with the cycle; both funnel every
//! hierarchy-plus-store mutation through one mutex, and change events
//! are dispatched synchronously inside that critical section so
//! subscribers observe them in mutation order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::metrics;
use crate::storage::traits::{KvStore, StorageError};

use super::hierarchy::{parse_auth_chain, IdentityHierarchy};
use super::proxy::ServiceProxy;
use super::{AuthType, IdentityChange, ServiceIdentity, StoredIdentity};

const IDENTITY_PREFIX: &str = "identity/";

fn identity_key(id: &str) -> String {
    format!("{IDENTITY_PREFIX}{id}")
}

/// Locally persisted cache of the gateway's identity scope.
pub struct ScopeCache {
    store: Arc<dyn KvStore>,
    proxy: Arc<dyn ServiceProxy>,
    /// Hierarchy and store mutate together under this one mutex.
    state: Mutex<IdentityHierarchy>,
    refresh_timestamps: DashMap<String, Instant>,
    events: broadcast::Sender<IdentityChange>,
    refresh_signal: Notify,
    refresh_complete: watch::Sender<bool>,
    last_cycle_started: parking_lot::Mutex<Option<Instant>>,
    last_cycle_completed: parking_lot::Mutex<Option<Instant>>,
    refresh_interval: Duration,
    refresh_delay: Duration,
}

impl ScopeCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        proxy: Arc<dyn ServiceProxy>,
        gateway_id: impl Into<String>,
        config: &GatewayConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let (refresh_complete, _) = watch::channel(false);
        Self {
            store,
            proxy,
            state: Mutex::new(IdentityHierarchy::new(gateway_id)),
            refresh_timestamps: DashMap::new(),
            events,
            refresh_signal: Notify::new(),
            refresh_complete,
            last_cycle_started: parking_lot::Mutex::new(None),
            last_cycle_completed: parking_lot::Mutex::new(None),
            refresh_interval: config.identity_refresh_interval(),
            refresh_delay: config.identity_refresh_delay(),
        }
    }

    /// Subscribe to identity change events.
    pub fn subscribe(&self) -> broadcast::Receiver<IdentityChange> {
        self.events.subscribe()
    }

    /// Load identities persisted by a previous run. Tombstones load as
    /// absences; no events fire for restored state.
    pub async fn init(&self) -> Result<usize, StorageError> {
        let entries = self.store.iterate(IDENTITY_PREFIX).await?;
        let mut state = self.state.lock().await;
        let mut loaded = 0;
        for (key, bytes) in entries {
            match serde_json::from_slice::<StoredIdentity>(&bytes) {
                Ok(record) => {
                    if let Some(identity) = record.identity {
                        state.insert_or_update(identity);
                        loaded += 1;
                    }
                }
                Err(error) => {
                    warn!(%key, %error, "skipping corrupt identity record");
                }
            }
        }
        info!(loaded, "identity scope cache initialized from store");
        Ok(loaded)
    }

    /// Spawn the singleton refresher task.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("identity scope refresher starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.refresh_cycle().await;
            tokio::select! {
                _ = self.refresh_signal.notified() => {}
                _ = tokio::time::sleep(self.refresh_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("identity scope refresher stopped");
    }

    /// One full reconciliation against the identity service.
    ///
    /// Upserts every identity the service reports, then tombstones ids
    /// the service no longer reports. The removal sweep is skipped if
    /// pagination fails partway: a half-seen scope must not purge the
    /// other half.
    #[instrument(skip(self))]
    pub async fn refresh_cycle(&self) {
        *self.last_cycle_started.lock() = Some(Instant::now());
        let _ = self.refresh_complete.send(false);
        debug!("identity refresh cycle starting");

        let mut pager = self.proxy.identities();
        let mut seen: HashSet<String> = HashSet::new();
        let mut iteration_complete = true;
        let mut updated = 0usize;
        while pager.has_next() {
            let page = pager.next_page().await;
            if page.is_empty() {
                warn!("identity page fetch failed, skipping removal sweep");
                iteration_complete = false;
                break;
            }
            for identity in page {
                seen.insert(identity.id.clone());
                match self.upsert(identity).await {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(error) => warn!(%error, "failed to persist identity"),
                }
            }
        }

        let mut removed = 0usize;
        if iteration_complete {
            let stale: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .all_ids()
                    .into_iter()
                    .filter(|id| !seen.contains(id))
                    .collect()
            };
            for id in stale {
                match self.remove_and_tombstone(&id).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(error) => warn!(%id, %error, "failed to tombstone identity"),
                }
            }
        }

        *self.last_cycle_completed.lock() = Some(Instant::now());
        let _ = self.refresh_complete.send(true);
        metrics::record_refresh_cycle(updated, removed);
        info!(
            seen = seen.len(),
            updated, removed, iteration_complete, "identity refresh cycle finished"
        );
    }

    /// Ask the refresher for an out-of-band cycle.
    ///
    /// Debounced: a request landing within the refresh delay of the
    /// last cycle start is a no-op that completes immediately. Multiple
    /// pending requests collapse into one cycle.
    pub fn initiate_refresh(&self) {
        let recently_started = self
            .last_cycle_started
            .lock()
            .is_some_and(|at| at.elapsed() < self.refresh_delay);
        if recently_started {
            debug!("refresh request debounced");
            let _ = self.refresh_complete.send(true);
            return;
        }
        let _ = self.refresh_complete.send(false);
        *self.last_cycle_started.lock() = Some(Instant::now());
        self.refresh_signal.notify_one();
    }

    /// Wait until the in-progress (or next requested) cycle finishes.
    pub async fn wait_refresh_complete(&self) {
        let mut receiver = self.refresh_complete.subscribe();
        let _ = receiver.wait_for(|complete| *complete).await;
    }

    /// When the last full cycle finished, if any.
    #[must_use]
    pub fn last_cycle_completed_at(&self) -> Option<Instant> {
        *self.last_cycle_completed.lock()
    }

    /// Targeted re-fetch of one identity, rate limited per id.
    ///
    /// Skipped while the previous lookup is fresh — unless the cached
    /// entry has no credentials yet, which may mean the identity was
    /// created before its auth was provisioned.
    #[instrument(skip(self))]
    pub async fn refresh_identity(&self, id: &str) -> Result<(), StorageError> {
        if !self.should_refresh(id).await {
            debug!(id, "identity refresh skipped, cache is fresh");
            return Ok(());
        }
        let (device_id, module_id) = match id.split_once('/') {
            Some((device, module)) => (device, Some(module)),
            None => (id, None),
        };
        match self.proxy.get_identity(device_id, module_id).await {
            Some(identity) => {
                self.upsert(identity).await?;
            }
            None => {
                self.remove_and_tombstone(id).await?;
            }
        }
        self.refresh_timestamps.insert(id.to_string(), Instant::now());
        Ok(())
    }

    /// Refresh every hop named in a serialized auth chain, in order.
    pub async fn refresh_auth_chain(&self, chain: &str) -> Result<(), StorageError> {
        for id in parse_auth_chain(chain) {
            self.refresh_identity(&id).await?;
        }
        Ok(())
    }

    pub async fn get_service_identity(&self, id: &str) -> Option<ServiceIdentity> {
        self.state.lock().await.get(id).cloned()
    }

    /// Serialized auth chain for `id`; `None` is an authoritative
    /// "not authorized through this gateway".
    pub async fn get_auth_chain(&self, id: &str) -> Option<String> {
        self.state.lock().await.auth_chain(id)
    }

    pub async fn get_immediate_children(&self, device_id: &str) -> Vec<ServiceIdentity> {
        self.state.lock().await.immediate_children(device_id)
    }

    async fn should_refresh(&self, id: &str) -> bool {
        let auth_pending = self
            .state
            .lock()
            .await
            .get(id)
            .is_some_and(|identity| identity.auth_type == AuthType::None);
        if auth_pending {
            return true;
        }
        match self.refresh_timestamps.get(id) {
            Some(at) => at.elapsed() > self.refresh_delay,
            None => true,
        }
    }

    /// Upsert into the hierarchy and persist, emitting `Updated` inside
    /// the critical section iff the cached identity actually changed.
    async fn upsert(&self, identity: ServiceIdentity) -> Result<bool, StorageError> {
        let record = StoredIdentity {
            id: identity.id.clone(),
            identity: Some(identity.clone()),
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|error| StorageError::Backend(error.to_string()))?;

        let mut state = self.state.lock().await;
        let changed = state.get(&identity.id) != Some(&identity);
        state.insert_or_update(identity.clone());
        self.store.put(&identity_key(&identity.id), bytes).await?;
        if changed {
            metrics::record_identity_change("updated");
            let _ = self.events.send(IdentityChange::Updated(identity));
        }
        Ok(changed)
    }

    /// Drop from the hierarchy and persist a tombstone. `Removed` fires
    /// iff the identity was present and enabled.
    async fn remove_and_tombstone(&self, id: &str) -> Result<bool, StorageError> {
        let record = StoredIdentity {
            id: id.to_string(),
            identity: None,
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|error| StorageError::Backend(error.to_string()))?;

        let mut state = self.state.lock().await;
        let previous = state.remove(id);
        self.store.put(&identity_key(id), bytes).await?;
        let was_enabled = previous.as_ref().is_some_and(ServiceIdentity::is_enabled);
        if was_enabled {
            metrics::record_identity_change("removed");
            let _ = self.events.send(IdentityChange::Removed(id.to_string()));
        }
        Ok(was_enabled)
    }
}
