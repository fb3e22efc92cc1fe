//! Twin documents and the machinery that keeps them in sync.
//!
//! A twin is a durable shadow document per client: `desired` properties
//! flow cloud→client, `reported` properties flow client→cloud. The
//! submodules layer up from pure data to orchestration:
//!
//! - [`document`]: the [`document::Twin`] / [`document::Collection`] model
//! - [`merge`]: structural diff and merge with null-as-removal
//! - [`validation`]: limits on client-supplied reported patches
//! - [`store`]: the durable twin store with version arbitration
//! - [`reported`]: the pending reported-property queue and its drain loop
//! - [`cloud`]: the upstream sync seam
//! - [`manager`]: the [`manager::TwinManager`] orchestrator

pub mod cloud;
pub mod document;
pub mod manager;
pub mod merge;
pub mod reported;
pub mod store;
pub mod validation;

use thiserror::Error;

use crate::storage::traits::StorageError;
use validation::ValidationError;

/// Errors surfaced by twin operations.
#[derive(Debug, Error)]
pub enum TwinError {
    /// The client-supplied patch was rejected; nothing was mutated.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The backing store failed; the operation was not acknowledged.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted record could not be decoded.
    #[error("persisted record for '{id}' is corrupt: {source}")]
    Codec {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}
