//! In-memory repository.
//!
//! Used by tests and by the `memory` storage backend. Keeps the same
//! ordering and atomicity guarantees as the Sled store: one mutex guards
//! both records and rows, so a replacement is never observed half-done.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{DocumentRecord, DocumentRepository, StorageError, StorageResult, UpdateRow};
use crate::sync::{DocumentId, UserId};

#[derive(Default)]
struct MemoryState {
    documents: HashMap<DocumentId, DocumentRecord>,
    /// Keyed by global sequence, so iteration is insertion order
    updates: BTreeMap<u64, UpdateRow>,
    next_seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Repository held entirely in process memory
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    meta_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `update_meta` calls so far
    pub fn meta_writes(&self) -> usize {
        self.meta_writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with [`StorageError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every row of a document, including soft-deleted ones
    pub fn all_rows(&self, document_id: &str) -> Vec<UpdateRow> {
        self.state
            .lock()
            .updates
            .values()
            .filter(|row| row.document_id == document_id)
            .cloned()
            .collect()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()> {
        self.check_writable()?;
        self.state
            .lock()
            .documents
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn select_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>> {
        Ok(self.state.lock().documents.get(document_id).cloned())
    }

    async fn update_meta(&self, document_id: &str, meta: &serde_json::Value) -> StorageResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let record = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;
        record.meta = meta.clone();
        record.updated_at = chrono::Utc::now().timestamp();
        self.meta_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_update(
        &self,
        document_id: &str,
        user_id: &UserId,
        update: &[u8],
    ) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let seq = state.next_seq();
        state.updates.insert(
            seq,
            UpdateRow {
                seq,
                document_id: document_id.to_string(),
                user_id: user_id.clone(),
                update: update.to_vec(),
                inserted_at: chrono::Utc::now().timestamp(),
                deleted_at: None,
            },
        );
        Ok(seq)
    }

    async fn select_updates(&self, document_id: &str) -> StorageResult<Vec<UpdateRow>> {
        Ok(self
            .state
            .lock()
            .updates
            .values()
            .filter(|row| row.document_id == document_id && row.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn replace_updates(
        &self,
        document_id: &str,
        replaced: &[u64],
        user_id: &UserId,
        snapshot: &[u8],
    ) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        for seq in replaced {
            if state
                .updates
                .get(seq)
                .is_some_and(|row| row.document_id == document_id)
            {
                state.updates.remove(seq);
            }
        }
        let seq = state.next_seq();
        state.updates.insert(
            seq,
            UpdateRow {
                seq,
                document_id: document_id.to_string(),
                user_id: user_id.clone(),
                update: snapshot.to_vec(),
                inserted_at: chrono::Utc::now().timestamp(),
                deleted_at: None,
            },
        );
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DocumentKind;

    #[tokio::test]
    async fn test_meta_write_counter() {
        let repo = MemoryRepository::new();
        repo.put_document(&DocumentRecord::new("d", DocumentKind::Presentation, "D"))
            .await
            .unwrap();

        repo.update_meta("d", &serde_json::json!({"title": "x"}))
            .await
            .unwrap();
        assert_eq!(repo.meta_writes(), 1);
        assert_eq!(
            repo.select_document("d").await.unwrap().unwrap().meta["title"],
            "x"
        );
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let repo = MemoryRepository::new();
        let user = UserId::new("u").unwrap();
        repo.set_fail_writes(true);

        let result = repo.insert_update("d", &user, &[1]).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert!(repo.all_rows("d").is_empty());

        repo.set_fail_writes(false);
        repo.insert_update("d", &user, &[1]).await.unwrap();
        assert_eq!(repo.all_rows("d").len(), 1);
    }
}
