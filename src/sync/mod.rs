//! Synchronization module for per-document CRDT collaboration.
//!
//! This module implements the authoritative server side of the Yjs sync
//! protocol. It provides:
//! - Binary lib0 protocol codec compatible with y-websocket clients
//! - One supervised actor per open document, serializing every mutation
//! - Debounced projection of the `meta` map into the document record
//! - A registry that finds or starts actors and tears them down when idle

pub mod access;
pub mod actor;
pub mod bounds;
pub mod document;
pub mod projection;
pub mod protocol;
pub mod registry;
pub mod schema;
mod writer;

pub use access::{Access, AccessResolver, RecordAccessPolicy};
pub use actor::{DocumentHandle, DocumentSnapshot, ObserverRegistration, ObserverSink};
pub use document::CollabDocument;
pub use registry::{ActorRegistry, RegistryStats};
pub use writer::PersistenceStats;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::StorageError;

/// Unique identifier for a document
pub type DocumentId = String;

/// Unique identifier for one observer (one connection on one document)
pub type ObserverId = uuid::Uuid;

/// Authenticated user identity used for update attribution.
///
/// Construction rejects empty ids, so a persisted row can never carry a
/// blank author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UserId::new(value).ok_or_else(|| "user id must not be empty".to_string())
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permission resolved for an observer before it may register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadWrite,
    ReadOnly,
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Document record does not exist (or is soft-deleted)
    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),
    /// Actor is shutting down; the caller should look it up again
    #[error("Document actor terminating: {0}")]
    ActorTerminating(DocumentId),
    /// Actor exited before answering
    #[error("Document actor unavailable: {0}")]
    ActorUnavailable(DocumentId),
    /// CRDT operation failed
    #[error("Document error: {0}")]
    Document(String),
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<document::DocumentError> for SyncError {
    fn from(err: document::DocumentError) -> Self {
        SyncError::Document(err.to_string())
    }
}
