//! Service identities and the locally cached authorization scope.
//!
//! A *service identity* is the authorization record for one device or
//! module entitled to connect through this gateway. Identities form a
//! forest rooted at the gateway's own identity; nested gateways chain
//! through their parents. The submodules:
//!
//! - [`hierarchy`]: the in-memory forest and auth-chain resolution
//! - [`proxy`]: the seam to the remote identity service
//! - [`cache`]: the persisted [`cache::ScopeCache`] with its refresher

pub mod cache;
pub mod hierarchy;
pub mod proxy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device or module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityKind {
    Device,
    Module,
}

/// How the client authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Sas,
    X509CaSigned,
    X509Thumbprint,
    /// Created without credentials; may be upgraded later, so cached
    /// entries with this type are always eligible for a re-fetch.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityStatus {
    Enabled,
    Disabled,
}

/// Credential material attached to an identity. Opaque to the core;
/// the authenticator interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSecrets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_thumbprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_thumbprint: Option<String>,
}

/// Authorization record for one device or module.
///
/// Module ids are `<deviceId>/<moduleId>` and parent the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    pub id: String,
    pub kind: IdentityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub auth_type: AuthType,
    pub status: IdentityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secrets: Option<AuthSecrets>,
}

impl ServiceIdentity {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == IdentityStatus::Enabled
    }

    /// The device part of the id (everything before the `/` for
    /// modules, the whole id for devices).
    #[must_use]
    pub fn device_id(&self) -> &str {
        self.id.split('/').next().unwrap_or(&self.id)
    }

    /// The module part of a module id.
    #[must_use]
    pub fn module_id(&self) -> Option<&str> {
        self.id.split_once('/').map(|(_, module)| module)
    }
}

/// Persisted scope record. An absent identity is a tombstone: the
/// service authoritatively reported this id out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ServiceIdentity>,
    pub timestamp: DateTime<Utc>,
}

impl StoredIdentity {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.identity.is_none()
    }
}

/// Change events emitted by the scope cache, exactly once per
/// observable transition.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityChange {
    /// Structurally new or changed identity.
    Updated(ServiceIdentity),
    /// Previously enabled identity left the scope.
    Removed(String),
}
