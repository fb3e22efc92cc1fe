//! Seams to transport-owned connection state.
//!
//! The transports own client sessions, subscriptions, QoS, and retry.
//! The core only asks two questions: is this client subscribed to a
//! topic, and if so, through which proxy can it be reached right now.

use async_trait::async_trait;
use thiserror::Error;

use crate::twin::document::Collection;

/// Topics a local client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTopic {
    /// Desired-property patches pushed from the gateway to the client.
    DesiredProperties,
}

/// Delivery to a local client failed.
///
/// Failures are transient by definition here; the transport owns
/// retry/QoS, so the core fires once and logs.
#[derive(Debug, Error)]
#[error("delivery to local client failed: {0}")]
pub struct ProxyError(pub String);

/// Handle for pushing data down to one connected client.
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    async fn on_desired_update(&self, patch: Collection) -> Result<(), ProxyError>;
}

/// View of the transport's connection table.
pub trait ConnectionRegistry: Send + Sync {
    fn is_subscribed(&self, id: &str, topic: SubscriptionTopic) -> bool;

    /// Proxy for a currently connected client, if any.
    fn proxy(&self, id: &str) -> Option<std::sync::Arc<dyn DeviceProxy>>;

    /// Ids of all currently connected clients.
    fn connected_clients(&self) -> Vec<String>;
}
