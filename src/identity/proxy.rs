//! Seam to the remote identity service.
//!
//! Implemented by the cloud-facing transport. Service errors never
//! surface as errors here: a failed page or lookup is an empty result,
//! and the cache treats emptiness as authoritative.

use async_trait::async_trait;

use super::ServiceIdentity;

/// Paginated walk over every identity in this gateway's scope. Page
/// size is the implementation's choice.
#[async_trait]
pub trait IdentityPager: Send {
    fn has_next(&self) -> bool;

    /// Next page; empty on service failure.
    async fn next_page(&mut self) -> Vec<ServiceIdentity>;
}

/// Targeted and scope-wide lookups against the remote identity service.
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Fresh pager positioned at the start of the scope.
    fn identities(&self) -> Box<dyn IdentityPager>;

    /// Look up one device (or module, when `module_id` is given).
    /// `None` when out of scope or the service is unreachable.
    async fn get_identity(
        &self,
        device_id: &str,
        module_id: Option<&str>,
    ) -> Option<ServiceIdentity>;
}
