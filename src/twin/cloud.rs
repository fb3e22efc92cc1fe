//! Upstream sync seam.
//!
//! Implemented by the cloud-facing transport. Reachability problems are
//! folded into the return values; these calls never error.

use async_trait::async_trait;

use super::document::{Collection, Twin};

/// Result of pushing a reported-property patch upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedOutcome {
    /// Accepted; the pending entry may be cleared.
    Ok,
    /// Not accepted right now; back off and retry.
    Transient,
    /// Will never be accepted; drop the pending entry.
    Permanent,
}

/// Cloud side of twin synchronization: pull twins, push reported
/// state. Delivery of desired patches to local clients is not a cloud
/// concern; that goes through the connection registry's proxies.
#[async_trait]
pub trait CloudSync: Send + Sync {
    /// Fetch the authoritative twin. `None` iff the cloud is
    /// unreachable or the id is unknown upstream.
    async fn get_twin(&self, id: &str) -> Option<Twin>;

    /// Push a reported-property patch upstream.
    async fn update_reported(&self, id: &str, patch: &Collection) -> ReportedOutcome;
}
