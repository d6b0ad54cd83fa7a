//! Sled-based storage implementation for document records and update logs.
//!
//! This module provides persistent storage using the Sled embedded database:
//! - Document records as JSON (the `meta` column is free-form JSON)
//! - Update rows as bincode, keyed so that a prefix scan returns one
//!   document's rows in insertion order
//! - Transactional snapshot replacement for compaction

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{
    DocumentRecord, DocumentRepository, StorageConfig, StorageError, StorageResult, UpdateRow,
};
use crate::sync::UserId;

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_UPDATES: &str = "updates";

/// Sled-based repository
#[derive(Clone)]
pub struct SledRepository {
    db: Arc<Db>,
    documents: Tree,
    updates: Tree,
}

impl SledRepository {
    /// Open or create a repository at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let updates = db.open_tree(TREE_UPDATES)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            updates,
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of update rows across all documents
    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    fn write_row(&self, row: &UpdateRow) -> StorageResult<()> {
        let key = update_key(&row.document_id, row.seq);
        self.updates.insert(key, bincode::serialize(row)?)?;
        Ok(())
    }
}

/// `[u32 len][document id][u64 seq]`, all big-endian, so ids containing any
/// byte sequence cannot collide and rows sort by sequence within a prefix.
fn update_prefix(document_id: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + document_id.len() + 8);
    buf.put_u32(document_id.len() as u32);
    buf.put_slice(document_id.as_bytes());
    buf
}

fn update_key(document_id: &str, seq: u64) -> Vec<u8> {
    let mut buf = update_prefix(document_id);
    buf.put_u64(seq);
    buf.to_vec()
}

/// Run a potentially long sled call on the blocking pool
async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
}

#[async_trait]
impl DocumentRepository for SledRepository {
    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.documents.insert(record.id.as_bytes(), bytes)?;
        Ok(())
    }

    async fn select_document(&self, document_id: &str) -> StorageResult<Option<DocumentRecord>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_meta(&self, document_id: &str, meta: &serde_json::Value) -> StorageResult<()> {
        let key = document_id.as_bytes();
        let now = chrono::Utc::now().timestamp();

        let result = self
            .documents
            .transaction(|tx| -> ConflictableTransactionResult<(), StorageError> {
                let Some(raw) = tx.get(key)? else {
                    return abort(StorageError::NotFound(document_id.to_string()));
                };
                let mut record: DocumentRecord = match serde_json::from_slice(&raw) {
                    Ok(record) => record,
                    Err(e) => return abort(StorageError::Json(e)),
                };
                record.meta = meta.clone();
                record.updated_at = now;
                let bytes = match serde_json::to_vec(&record) {
                    Ok(bytes) => bytes,
                    Err(e) => return abort(StorageError::Json(e)),
                };
                tx.insert(key, bytes)?;
                Ok(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StorageError::Sled(err),
        })
    }

    async fn insert_update(
        &self,
        document_id: &str,
        user_id: &UserId,
        update: &[u8],
    ) -> StorageResult<u64> {
        let row = UpdateRow {
            seq: self.db.generate_id()?,
            document_id: document_id.to_string(),
            user_id: user_id.clone(),
            update: update.to_vec(),
            inserted_at: chrono::Utc::now().timestamp(),
            deleted_at: None,
        };
        self.write_row(&row)?;
        Ok(row.seq)
    }

    async fn select_updates(&self, document_id: &str) -> StorageResult<Vec<UpdateRow>> {
        let prefix = update_prefix(document_id);
        let updates = self.updates.clone();
        blocking(move || {
            let mut rows = Vec::new();
            for item in updates.scan_prefix(&prefix[..]) {
                let (_, value) = item?;
                let row: UpdateRow = bincode::deserialize(&value)?;
                if row.deleted_at.is_none() {
                    rows.push(row);
                }
            }
            Ok(rows)
        })
        .await
    }

    async fn replace_updates(
        &self,
        document_id: &str,
        replaced: &[u64],
        user_id: &UserId,
        snapshot: &[u8],
    ) -> StorageResult<u64> {
        let row = UpdateRow {
            seq: self.db.generate_id()?,
            document_id: document_id.to_string(),
            user_id: user_id.clone(),
            update: snapshot.to_vec(),
            inserted_at: chrono::Utc::now().timestamp(),
            deleted_at: None,
        };
        let new_key = update_key(document_id, row.seq);
        let new_value = bincode::serialize(&row)?;
        let old_keys: Vec<Vec<u8>> = replaced
            .iter()
            .map(|seq| update_key(document_id, *seq))
            .collect();

        let updates = self.updates.clone();
        blocking(move || {
            updates
                .transaction(|tx| -> ConflictableTransactionResult<()> {
                    for key in &old_keys {
                        tx.remove(key.as_slice())?;
                    }
                    tx.insert(new_key.as_slice(), new_value.as_slice())?;
                    Ok(())
                })
                .map_err(|e: TransactionError<()>| {
                    StorageError::Transaction(format!("{:?}", e))
                })
        })
        .await?;

        Ok(row.seq)
    }
}

impl Drop for SledRepository {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DocumentKind;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (SledRepository, TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_flush_interval_ms(0);
        (SledRepository::open(config).unwrap(), dir)
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_document_save_load() {
        let (store, _dir) = test_store();
        let record = DocumentRecord::new("doc-1", DocumentKind::Presentation, "Deck")
            .with_meta(serde_json::json!({"title": "Hello"}));

        store.put_document(&record).await.unwrap();
        let loaded = store.select_document("doc-1").await.unwrap().unwrap();

        assert_eq!(loaded.name, "Deck");
        assert_eq!(loaded.meta["title"], "Hello");
        assert!(store.select_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_meta() {
        let (store, _dir) = test_store();
        store
            .put_document(&DocumentRecord::new("doc-1", DocumentKind::Theme, "Theme"))
            .await
            .unwrap();

        store
            .update_meta("doc-1", &serde_json::json!({"name": "Solar"}))
            .await
            .unwrap();

        let loaded = store.select_document("doc-1").await.unwrap().unwrap();
        assert_eq!(loaded.meta["name"], "Solar");

        let missing = store.update_meta("nope", &serde_json::json!({})).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_updates_keep_insertion_order() {
        let (store, _dir) = test_store();
        for i in 1..=5u8 {
            store
                .insert_update("doc-1", &user("user-1"), &[i; 4])
                .await
                .unwrap();
        }
        store
            .insert_update("doc-2", &user("user-2"), &[9])
            .await
            .unwrap();

        let rows = store.select_updates("doc-1").await.unwrap();
        let firsts: Vec<u8> = rows.iter().map(|r| r.update[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3, 4, 5]);
        assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(rows.iter().all(|r| r.user_id.as_str() == "user-1"));
    }

    #[tokio::test]
    async fn test_prefix_does_not_leak_between_documents() {
        let (store, _dir) = test_store();
        store.insert_update("a", &user("u"), &[1]).await.unwrap();
        store.insert_update("a:b", &user("u"), &[2]).await.unwrap();

        assert_eq!(store.select_updates("a").await.unwrap().len(), 1);
        assert_eq!(store.select_updates("a:b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_deleted_rows_are_skipped() {
        let (store, _dir) = test_store();
        let seq = store.insert_update("doc-1", &user("u"), &[1]).await.unwrap();
        store.insert_update("doc-1", &user("u"), &[2]).await.unwrap();

        let mut rows = store.select_updates("doc-1").await.unwrap();
        let mut first = rows.remove(0);
        assert_eq!(first.seq, seq);
        first.deleted_at = Some(1);
        store.write_row(&first).unwrap();

        let rows = store.select_updates("doc-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].update, vec![2]);
    }

    #[tokio::test]
    async fn test_replace_updates_is_selective() {
        let (store, _dir) = test_store();
        let a = store.insert_update("doc-1", &user("u"), &[1]).await.unwrap();
        let b = store.insert_update("doc-1", &user("u"), &[2]).await.unwrap();
        // Appended after the snapshot was taken
        store.insert_update("doc-1", &user("u"), &[3]).await.unwrap();

        store
            .replace_updates("doc-1", &[a, b], &user("u"), &[7, 7])
            .await
            .unwrap();

        let rows = store.select_updates("doc-1").await.unwrap();
        let payloads: Vec<Vec<u8>> = rows.into_iter().map(|r| r.update).collect();
        assert_eq!(payloads, vec![vec![3], vec![7, 7]]);
        assert_eq!(store.update_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_large_scans_run_concurrently() {
        let (store, _dir) = test_store();
        for i in 0..500u32 {
            store
                .insert_update("big", &user("u"), &i.to_be_bytes())
                .await
                .unwrap();
        }

        let scans: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.select_updates("big").await })
            })
            .collect();
        // Timers keep firing while the scans hold the blocking pool
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        })
        .await
        .unwrap();

        for scan in scans {
            let rows = scan.await.unwrap().unwrap();
            assert_eq!(rows.len(), 500);
            assert_eq!(rows[499].update, 499u32.to_be_bytes().to_vec());
        }
    }
}
