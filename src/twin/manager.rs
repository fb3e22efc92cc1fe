// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Twin orchestration.
//!
//! The [`TwinManager`] ties the durable store, the reported queue, the
//! cloud seam, and the transport connection table together. Per-id
//! ordering comes from two striped lock tables — one for twin state,
//! one for queue state — never held at the same time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::connection::{ConnectionRegistry, SubscriptionTopic};
use crate::lock::KeyedLocks;
use crate::metrics;
use crate::storage::traits::KvStore;

use super::cloud::CloudSync;
use super::document::{Collection, Twin};
use super::merge::diff_maps;
use super::reported::ReportedQueue;
use super::store::{DesiredOutcome, TwinStore};
use super::validation::validate_reported_patch;
use super::TwinError;

/// Orchestrates twin reads, updates, and reconnection resyncs.
pub struct TwinManager {
    kv: Arc<dyn KvStore>,
    store: TwinStore,
    queue: Arc<ReportedQueue>,
    cloud: Arc<dyn CloudSync>,
    connections: Arc<dyn ConnectionRegistry>,
    twin_locks: Arc<KeyedLocks>,
    last_sync: DashMap<String, Instant>,
    min_sync_period: Duration,
    cloud_timeout: Duration,
    shutdown_grace: Duration,
    shutdown: watch::Sender<bool>,
}

impl TwinManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        cloud: Arc<dyn CloudSync>,
        connections: Arc<dyn ConnectionRegistry>,
        config: GatewayConfig,
    ) -> Self {
        let twin_locks = Arc::new(KeyedLocks::new(config.lock_stripes));
        let queue_locks = Arc::new(KeyedLocks::new(config.lock_stripes));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let store = TwinStore::new(kv.clone(), twin_locks.clone());
        let queue = Arc::new(ReportedQueue::new(
            kv.clone(),
            cloud.clone(),
            queue_locks,
            &config,
            shutdown_rx,
        ));
        Self {
            kv,
            store,
            queue,
            cloud,
            connections,
            twin_locks,
            last_sync: DashMap::new(),
            min_sync_period: config.min_twin_sync_period(),
            cloud_timeout: config.cloud_timeout(),
            shutdown_grace: config.shutdown_grace(),
            shutdown,
        }
    }

    /// Restore queue state persisted by a previous run and schedule
    /// drains for it.
    pub async fn start(&self) -> Result<usize, TwinError> {
        let restored = self.queue.restore().await?;
        if restored > 0 {
            info!(restored, "restored pending reported patches");
            self.queue.clone().sync_all();
        }
        Ok(restored)
    }

    /// Read a twin, cloud-first.
    ///
    /// A reachable cloud refreshes the store and the sync timestamp.
    /// Otherwise the stored twin is returned, or an empty one if the
    /// client was never seen.
    #[instrument(skip(self))]
    pub async fn get_twin(&self, id: &str) -> Result<Twin, TwinError> {
        if let Some(twin) = self.cloud_get(id).await {
            let _guard = self.twin_locks.acquire(id).await;
            self.store.put(id, &twin).await?;
            self.last_sync.insert(id.to_string(), Instant::now());
            metrics::record_twin_pull("cloud");
            return Ok(twin);
        }
        match self.store.get(id).await? {
            Some(twin) => {
                metrics::record_twin_pull("store");
                Ok(twin)
            }
            None => {
                metrics::record_twin_pull("default");
                Ok(Twin::default())
            }
        }
    }

    /// Read the stored twin only, without touching the cloud.
    pub async fn get_cached_twin(&self, id: &str) -> Result<Option<Twin>, TwinError> {
        self.store.get(id).await
    }

    /// Apply a desired-property patch from the cloud.
    ///
    /// In-sequence patches are stored and forwarded to the client if it
    /// subscribes to desired updates; lack of a subscription suppresses
    /// the push but not the store update. A version gap triggers a full
    /// resync instead.
    #[instrument(skip(self, patch), fields(version = patch.version))]
    pub async fn update_desired(&self, id: &str, patch: &Collection) -> Result<(), TwinError> {
        match self.store.apply_desired(id, patch).await? {
            DesiredOutcome::Applied => {
                metrics::record_desired_patch("applied");
                self.forward_desired(id, patch.clone()).await;
                Ok(())
            }
            DesiredOutcome::Stale { stored, patch } => {
                metrics::record_desired_patch("stale");
                debug!(id, stored, patch, "ignoring stale desired patch");
                Ok(())
            }
            DesiredOutcome::VersionGap { stored, patch } => {
                metrics::record_desired_patch("gap");
                debug!(id, stored, patch, "desired version gap, resyncing");
                self.resync(id).await
            }
        }
    }

    /// Apply a reported-property patch from a local client.
    ///
    /// The patch is validated first; rejection mutates nothing. On
    /// success it is durable in both the twin store and the pending
    /// queue before the upstream drain is scheduled.
    #[instrument(skip(self, patch))]
    pub async fn update_reported(&self, id: &str, patch: &Collection) -> Result<(), TwinError> {
        validate_reported_patch(&patch.properties)?;
        self.store.apply_reported(id, patch).await?;
        self.queue.enqueue(id, patch).await?;
        metrics::record_reported_update();
        self.queue.clone().initiate_sync(id);
        Ok(())
    }

    /// Reconnection hook: drain pending reported state and resync the
    /// twin for every currently connected client.
    #[instrument(skip(self))]
    pub async fn on_device_connected(&self) {
        for id in self.connections.connected_clients() {
            self.queue.clone().initiate_sync(&id);
            if let Err(error) = self.resync(&id).await {
                warn!(id = %id, %error, "reconnect resync failed");
            }
        }
    }

    /// Stop background work, wait out in-flight drains, close storage.
    pub async fn shutdown(&self) {
        info!("twin manager shutting down");
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(self.shutdown_grace, self.queue.quiesce())
            .await
            .is_err()
        {
            warn!("reported drains still in flight after grace period");
        }
        if let Err(error) = self.kv.close().await {
            error!(%error, "failed to close store");
        }
    }

    /// Pull the authoritative twin and push the missed desired delta to
    /// the client, at most once per sync period.
    ///
    /// Under the twin lock: read stored, fetch cloud (abort silently if
    /// unreachable), store, diff stored→cloud desired, fan out.
    async fn resync(&self, id: &str) -> Result<(), TwinError> {
        if !self.sync_due(id) {
            metrics::record_resync("throttled");
            debug!(id, "resync throttled");
            return Ok(());
        }

        let _guard = self.twin_locks.acquire(id).await;
        let stored = self.store.get(id).await?.unwrap_or_default();
        let Some(cloud_twin) = self.cloud_get(id).await else {
            metrics::record_resync("unreachable");
            debug!(id, "cloud unreachable, resync skipped");
            return Ok(());
        };

        self.store.put(id, &cloud_twin).await?;
        self.last_sync.insert(id.to_string(), Instant::now());
        metrics::record_resync("synced");

        let delta = diff_maps(
            &stored.properties.desired.properties,
            &cloud_twin.properties.desired.properties,
        );
        if delta.is_empty() {
            return Ok(());
        }
        debug!(id, keys = delta.len(), "fanning out missed desired delta");
        let patch = Collection::new(cloud_twin.properties.desired.version, delta);
        self.forward_desired(id, patch).await;
        Ok(())
    }

    fn sync_due(&self, id: &str) -> bool {
        match self.last_sync.get(id) {
            Some(at) => at.elapsed() > self.min_sync_period,
            None => true,
        }
    }

    /// Fire a desired patch at the client's proxy, once. The transport
    /// owns retry and QoS; a delivery failure is logged and dropped.
    async fn forward_desired(&self, id: &str, patch: Collection) {
        if !self
            .connections
            .is_subscribed(id, SubscriptionTopic::DesiredProperties)
        {
            metrics::record_fanout("unsubscribed");
            debug!(id, "client not subscribed to desired updates");
            return;
        }
        let Some(proxy) = self.connections.proxy(id) else {
            metrics::record_fanout("disconnected");
            debug!(id, "client has no live proxy");
            return;
        };
        match proxy.on_desired_update(patch).await {
            Ok(()) => metrics::record_fanout("sent"),
            Err(error) => {
                metrics::record_fanout("failed");
                warn!(id, %error, "desired update delivery failed");
            }
        }
    }

    async fn cloud_get(&self, id: &str) -> Option<Twin> {
        let _timer = metrics::LatencyTimer::new("cloud", "get_twin");
        match tokio::time::timeout(self.cloud_timeout, self.cloud.get_twin(id)).await {
            Ok(twin) => twin,
            Err(_) => {
                warn!(id, "cloud twin fetch timed out");
                None
            }
        }
    }
}
