//! Storage module for document records and the per-document update log.
//!
//! The sync engine only talks to persistence through [`DocumentRepository`],
//! which mirrors the relational query surface the rest of the platform
//! exposes. Two implementations are provided:
//! - [`SledRepository`] backed by the Sled embedded database
//! - [`MemoryRepository`] for tests and ephemeral deployments
//!
//! [`UpdateLog`] builds inheritance resolution and compaction on top.

mod memory;
mod sled_store;
pub mod update_log;

pub use memory::MemoryRepository;
pub use sled_store::SledRepository;
pub use update_log::UpdateLog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::{DocumentId, UserId};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Kind of collaborative document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Presentation,
    Theme,
    Event,
}

/// Persisted document record (owned by the document-management layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub name: String,
    pub is_public: bool,
    /// Document whose history is replayed before this one's
    pub base_document_id: Option<DocumentId>,
    /// Relational snapshot of the CRDT `meta` map
    pub meta: serde_json::Value,
    pub owner_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, kind: DocumentKind, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            is_public: false,
            base_document_id: None,
            meta: serde_json::Value::Object(Default::default()),
            owner_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_base(mut self, base_document_id: impl Into<String>) -> Self {
        self.base_document_id = Some(base_document_id.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// One persisted CRDT delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRow {
    /// Monotonic insertion sequence
    pub seq: u64,
    pub document_id: DocumentId,
    /// Attribution; always present
    pub user_id: UserId,
    /// Opaque v1-encoded yrs update
    pub update: Vec<u8>,
    pub inserted_at: i64,
    pub deleted_at: Option<i64>,
}

/// Persistence query surface consumed by the sync engine
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Insert or overwrite a document record
    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()>;

    /// Fetch a document record, including soft-deleted ones
    async fn select_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>>;

    /// Overwrite the `meta` column of a document record
    async fn update_meta(&self, document_id: &str, meta: &serde_json::Value) -> StorageResult<()>;

    /// Append one update row, returning its sequence number
    async fn insert_update(
        &self,
        document_id: &str,
        user_id: &UserId,
        update: &[u8],
    ) -> StorageResult<u64>;

    /// Non-deleted update rows of one document in insertion order
    async fn select_updates(&self, document_id: &str) -> StorageResult<Vec<UpdateRow>>;

    /// Atomically remove the rows in `replaced` and insert one snapshot row.
    ///
    /// Rows not listed (e.g. appended concurrently) are left untouched.
    async fn replace_updates(
        &self,
        document_id: &str,
        replaced: &[u64],
        user_id: &UserId,
        snapshot: &[u8],
    ) -> StorageResult<u64>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/docs.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}
