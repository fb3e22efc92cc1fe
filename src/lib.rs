//! # Edge Gateway Core
//!
//! The durable core of an edge gateway that mediates between locally
//! connected clients (devices and modules) and a remote cloud backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Local Transports                        │
//! │  • Drive twin reads/updates via TwinManager                 │
//! │  • Authenticate clients against ScopeCache                  │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                          │
//!                  ▼                          ▼
//! ┌──────────────────────────┐  ┌─────────────────────────────┐
//! │       Twin Manager       │  │    Identity Scope Cache     │
//! │  • Desired/reported twin │  │  • Hierarchical identity    │
//! │    documents per client  │  │    forest + auth chains     │
//! │  • Version arbitration   │  │  • Periodic + on-demand     │
//! │  • Resync & delta fanout │  │    refresh, change events   │
//! │  • Reported-props queue  │  │  • Persisted with           │
//! │    with merge-on-retry   │  │    tombstones               │
//! └──────────────────────────┘  └─────────────────────────────┘
//!                  │                          │
//!                  ▼                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            KvStore (pluggable persistence seam)             │
//! │   twin/<id>        reported/<id>        identity/<id>       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edge_gateway::{GatewayConfig, MemoryKvStore, ScopeCache, TwinManager};
//! # use edge_gateway::{CloudSync, ConnectionRegistry, ServiceProxy};
//! # async fn example(
//! #     cloud: Arc<dyn CloudSync>,
//! #     connections: Arc<dyn ConnectionRegistry>,
//! #     service: Arc<dyn ServiceProxy>,
//! # ) {
//! let config = GatewayConfig::default();
//! let store: Arc<dyn edge_gateway::KvStore> = Arc::new(MemoryKvStore::new());
//!
//! let manager = TwinManager::new(store.clone(), cloud, connections, config.clone());
//! manager.start().await.expect("restore pending reported state");
//!
//! let cache = Arc::new(ScopeCache::new(store, service, "edge-gw", &config));
//! cache.init().await.expect("load persisted identities");
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let refresher = cache.clone().spawn(shutdown_rx);
//!
//! // ... serve traffic ...
//!
//! let _ = shutdown_tx.send(true);
//! let _ = refresher.await;
//! manager.shutdown().await;
//! # }
//! ```
//!
//! ## Features
//!
//! - **Durable twins**: desired/reported shadow documents survive restarts
//! - **Version arbitration**: stale desired patches ignored, gaps resynced
//! - **Merge-buffered reported queue**: one pending patch per client,
//!   coalesced drains, merge-on-conflict retry
//! - **Offline reads**: twin reads fall back to the store when the cloud
//!   is unreachable
//! - **Scope cache**: locally persisted identity hierarchy with auth-chain
//!   resolution and exactly-once change events
//! - **Striped key locks**: per-client ordering without unbounded memory
//!
//! ## Modules
//!
//! - [`twin`]: twin documents, diff/merge, durable store, reported queue,
//!   and the [`TwinManager`] orchestrator
//! - [`identity`]: service identities, the hierarchy, and the [`ScopeCache`]
//! - [`storage`]: the [`KvStore`] persistence seam and an in-memory impl
//! - [`connection`]: seams to the transport-owned connection state
//! - [`lock`]: striped per-key asynchronous mutual exclusion

pub mod config;
pub mod connection;
pub mod identity;
pub mod lock;
pub mod metrics;
pub mod storage;
pub mod twin;

pub use config::GatewayConfig;
pub use connection::{ConnectionRegistry, DeviceProxy, ProxyError, SubscriptionTopic};
pub use identity::cache::ScopeCache;
pub use identity::hierarchy::IdentityHierarchy;
pub use identity::proxy::{IdentityPager, ServiceProxy};
pub use identity::{
    AuthSecrets, AuthType, IdentityChange, IdentityKind, IdentityStatus, ServiceIdentity,
    StoredIdentity,
};
pub use lock::KeyedLocks;
pub use storage::memory::MemoryKvStore;
pub use storage::traits::{KvStore, StorageError};
pub use twin::cloud::{CloudSync, ReportedOutcome};
pub use twin::document::{Collection, Twin, TwinProperties};
pub use twin::manager::TwinManager;
pub use twin::reported::ReportedQueue;
pub use twin::store::{DesiredOutcome, TwinStore};
pub use twin::validation::ValidationError;
pub use twin::TwinError;
