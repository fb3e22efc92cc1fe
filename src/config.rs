//! Configuration for the gateway core.
//!
//! # Example
//!
//! ```
//! use edge_gateway::GatewayConfig;
//!
//! // Minimal config (uses defaults)
//! let config = GatewayConfig::default();
//! assert_eq!(config.min_twin_sync_period_secs, 120); // 2 minutes
//! assert_eq!(config.lock_stripes, 10);
//!
//! // Full config
//! let config = GatewayConfig {
//!     min_twin_sync_period_secs: 60,
//!     identity_refresh_interval_secs: 1800,
//!     ..Default::default()
//! };
//! assert_eq!(config.min_twin_sync_period().as_secs(), 60);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the gateway core.
///
/// All fields have defaults suitable for a small gateway; deployments
/// mostly tune the sync and refresh cadences.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Minimum interval between cloud twin resyncs per client (default: 120 s)
    #[serde(default = "default_min_twin_sync_period_secs")]
    pub min_twin_sync_period_secs: u64,

    /// Interval between periodic identity scope refresh cycles (default: 3600 s)
    #[serde(default = "default_identity_refresh_interval_secs")]
    pub identity_refresh_interval_secs: u64,

    /// Debounce window for on-demand refreshes and targeted identity
    /// lookups (default: 300 s)
    #[serde(default = "default_identity_refresh_delay_secs")]
    pub identity_refresh_delay_secs: u64,

    /// Number of mutexes in each keyed lock table (default: 10)
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// Minimum interval between upstream reported-property syncs per
    /// client (default: 5 s)
    #[serde(default = "default_reported_sync_interval_secs")]
    pub reported_sync_interval_secs: u64,

    /// Backoff after a transient upstream rejection (default: 5 s)
    #[serde(default = "default_reported_backoff_secs")]
    pub reported_backoff_secs: u64,

    /// Upper bound on a single cloud call (default: 10 s)
    #[serde(default = "default_cloud_timeout_secs")]
    pub cloud_timeout_secs: u64,

    /// Grace period for in-flight drains during shutdown (default: 5 s)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Capacity of the identity change broadcast channel (default: 64)
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_min_twin_sync_period_secs() -> u64 { 120 }
fn default_identity_refresh_interval_secs() -> u64 { 3600 }
fn default_identity_refresh_delay_secs() -> u64 { 300 }
fn default_lock_stripes() -> usize { 10 }
fn default_reported_sync_interval_secs() -> u64 { 5 }
fn default_reported_backoff_secs() -> u64 { 5 }
fn default_cloud_timeout_secs() -> u64 { 10 }
fn default_shutdown_grace_secs() -> u64 { 5 }
fn default_event_channel_capacity() -> usize { 64 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_twin_sync_period_secs: default_min_twin_sync_period_secs(),
            identity_refresh_interval_secs: default_identity_refresh_interval_secs(),
            identity_refresh_delay_secs: default_identity_refresh_delay_secs(),
            lock_stripes: default_lock_stripes(),
            reported_sync_interval_secs: default_reported_sync_interval_secs(),
            reported_backoff_secs: default_reported_backoff_secs(),
            cloud_timeout_secs: default_cloud_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn min_twin_sync_period(&self) -> Duration {
        Duration::from_secs(self.min_twin_sync_period_secs)
    }

    pub fn identity_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.identity_refresh_interval_secs)
    }

    pub fn identity_refresh_delay(&self) -> Duration {
        Duration::from_secs(self.identity_refresh_delay_secs)
    }

    pub fn reported_sync_interval(&self) -> Duration {
        Duration::from_secs(self.reported_sync_interval_secs)
    }

    pub fn reported_backoff(&self) -> Duration {
        Duration::from_secs(self.reported_backoff_secs)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
