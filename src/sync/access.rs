//! Permission check at the connection boundary.
//!
//! Resolved before any actor interaction. "Does not exist" and "exists but
//! forbidden" both resolve to [`Access::NotFound`] so callers cannot test
//! for private documents.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Permission, SyncResult, UserId};
use crate::storage::DocumentRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    NotFound,
}

impl Access {
    /// Permission to register with, or `None` if the connection is refused
    pub fn permission(self) -> Option<Permission> {
        match self {
            Access::ReadWrite => Some(Permission::ReadWrite),
            Access::ReadOnly => Some(Permission::ReadOnly),
            Access::NotFound => None,
        }
    }
}

#[async_trait]
pub trait AccessResolver: Send + Sync {
    async fn resolve(&self, document_id: &str, user_id: Option<&UserId>) -> SyncResult<Access>;
}

/// Decides access from the document record alone:
/// the owner may write, anyone may read a public document.
pub struct RecordAccessPolicy {
    repo: Arc<dyn DocumentRepository>,
}

impl RecordAccessPolicy {
    pub fn new(repo: Arc<dyn DocumentRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl AccessResolver for RecordAccessPolicy {
    async fn resolve(&self, document_id: &str, user_id: Option<&UserId>) -> SyncResult<Access> {
        let Some(record) = self.repo.select_document(document_id).await? else {
            return Ok(Access::NotFound);
        };
        if record.is_deleted() {
            return Ok(Access::NotFound);
        }

        let is_owner = match (user_id, record.owner_id.as_deref()) {
            (Some(user), Some(owner)) => user.as_str() == owner,
            _ => false,
        };

        Ok(if is_owner {
            Access::ReadWrite
        } else if record.is_public {
            Access::ReadOnly
        } else {
            Access::NotFound
        })
    }
}
