//! Append-only update log with base-document inheritance and compaction.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DocumentRepository, StorageResult};
use crate::sync::{DocumentId, UserId};

/// Result of a compaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compaction {
    /// The document has no rows of its own
    Skipped,
    /// `replaced` rows were superseded by the snapshot row `seq`
    Compacted { replaced: usize, seq: u64 },
}

/// Durable per-document history on top of a [`DocumentRepository`]
#[derive(Clone)]
pub struct UpdateLog {
    repo: Arc<dyn DocumentRepository>,
}

impl UpdateLog {
    pub fn new(repo: Arc<dyn DocumentRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn DocumentRepository> {
        &self.repo
    }

    /// Append one attributed update
    pub async fn append_update(
        &self,
        document_id: &str,
        user_id: &UserId,
        update: &[u8],
    ) -> StorageResult<u64> {
        self.repo.insert_update(document_id, user_id, update).await
    }

    /// Ancestors of a document, root first, excluding the document itself.
    ///
    /// The walk stops at a missing or soft-deleted ancestor and at the first
    /// id already visited, so cyclic chains terminate.
    pub async fn inheritance_chain(&self, document_id: &str) -> StorageResult<Vec<DocumentId>> {
        let mut visited: HashSet<DocumentId> = HashSet::new();
        visited.insert(document_id.to_string());

        let mut chain = Vec::new();
        let mut next = self
            .repo
            .select_document(document_id)
            .await?
            .and_then(|record| record.base_document_id);

        while let Some(base_id) = next {
            if !visited.insert(base_id.clone()) {
                warn!(
                    "Inheritance cycle for document {} at {}; stopping walk",
                    document_id, base_id
                );
                break;
            }
            match self.repo.select_document(&base_id).await? {
                Some(record) if !record.is_deleted() => {
                    next = record.base_document_id.clone();
                    chain.push(base_id);
                }
                Some(_) => {
                    debug!("Base document {} is deleted; chain ends", base_id);
                    break;
                }
                None => {
                    debug!("Base document {} not found; chain ends", base_id);
                    break;
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Ordered updates to replay for a document: each ancestor's log root
    /// first, then the document's own log.
    pub async fn load_resolved_history(&self, document_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        let chain = self.inheritance_chain(document_id).await?;

        let mut history = Vec::new();
        for ancestor in chain.iter().map(String::as_str).chain([document_id]) {
            let rows = self.repo.select_updates(ancestor).await?;
            history.extend(rows.into_iter().map(|row| row.update));
        }

        debug!(
            "Resolved {} updates for {} across {} ancestors",
            history.len(),
            document_id,
            chain.len()
        );
        Ok(history)
    }

    /// Replace the document's own rows with a single full-state snapshot.
    ///
    /// The snapshot row keeps the attribution of the newest row it replaces.
    pub async fn compact(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<Compaction> {
        let rows = self.repo.select_updates(document_id).await?;
        let Some(last) = rows.last() else {
            return Ok(Compaction::Skipped);
        };

        let user_id = last.user_id.clone();
        let replaced: Vec<u64> = rows.iter().map(|row| row.seq).collect();
        let seq = self
            .repo
            .replace_updates(document_id, &replaced, &user_id, snapshot)
            .await?;

        info!(
            "Compacted {} updates of document {} into snapshot {}",
            replaced.len(),
            document_id,
            seq
        );
        Ok(Compaction::Compacted {
            replaced: replaced.len(),
            seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentKind, DocumentRecord, MemoryRepository};
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    async fn log_with(records: Vec<DocumentRecord>) -> (UpdateLog, Arc<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        for record in &records {
            repo.put_document(record).await.unwrap();
        }
        (UpdateLog::new(repo.clone()), repo)
    }

    fn record(id: &str, base: Option<&str>) -> DocumentRecord {
        let record = DocumentRecord::new(id, DocumentKind::Presentation, id);
        match base {
            Some(base) => record.with_base(base),
            None => record,
        }
    }

    #[tokio::test]
    async fn test_inheritance_ordering() {
        let (log, _) = log_with(vec![
            record("grandparent", None),
            record("parent", Some("grandparent")),
            record("child", Some("parent")),
        ])
        .await;

        log.append_update("child", &user("u"), b"child").await.unwrap();
        log.append_update("grandparent", &user("u"), b"grandparent")
            .await
            .unwrap();
        log.append_update("parent", &user("u"), b"parent").await.unwrap();

        let history = log.load_resolved_history("child").await.unwrap();
        assert_eq!(
            history,
            vec![b"grandparent".to_vec(), b"parent".to_vec(), b"child".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_two_document_cycle_terminates() {
        let (log, _) = log_with(vec![record("a", Some("b")), record("b", Some("a"))]).await;
        log.append_update("a", &user("u"), b"a").await.unwrap();
        log.append_update("b", &user("u"), b"b").await.unwrap();

        let history = log.load_resolved_history("a").await.unwrap();
        assert_eq!(history, vec![b"b".to_vec(), b"a".to_vec()]);

        let history = log.load_resolved_history("b").await.unwrap();
        assert_eq!(history, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_self_reference_and_longer_cycle() {
        let (log, _) = log_with(vec![
            record("self", Some("self")),
            record("x", Some("y")),
            record("y", Some("z")),
            record("z", Some("y")),
        ])
        .await;

        assert!(log.inheritance_chain("self").await.unwrap().is_empty());
        assert_eq!(
            log.inheritance_chain("x").await.unwrap(),
            vec!["z".to_string(), "y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_or_deleted_base_ends_chain() {
        let mut deleted = record("deleted", Some("root"));
        deleted.deleted_at = Some(1);
        let (log, _) = log_with(vec![
            record("root", None),
            deleted,
            record("orphan", Some("ghost")),
            record("child", Some("deleted")),
        ])
        .await;

        assert!(log.inheritance_chain("orphan").await.unwrap().is_empty());
        assert!(log.inheritance_chain("child").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compaction_reproduces_content() {
        let (log, repo) = log_with(vec![record("doc", None)]).await;

        let author = Doc::with_client_id(1);
        let text = author.get_or_insert_text("content");
        for (i, chunk) in ["A", "B", "C"].iter().enumerate() {
            let before = author.transact().state_vector();
            text.insert(&mut author.transact_mut(), i as u32, chunk);
            let delta = author.transact().encode_diff_v1(&before);
            let who = if i == 2 { "last" } else { "first" };
            log.append_update("doc", &user(who), &delta).await.unwrap();
        }

        let replayed = Doc::new();
        for update in log.load_resolved_history("doc").await.unwrap() {
            replayed
                .transact_mut()
                .apply_update(Update::decode_v1(&update).unwrap())
                .unwrap();
        }
        let snapshot = replayed
            .transact()
            .encode_state_as_update_v1(&StateVector::default());

        let outcome = log.compact("doc", &snapshot).await.unwrap();
        assert!(matches!(outcome, Compaction::Compacted { replaced: 3, .. }));

        let rows = repo.all_rows("doc");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id.as_str(), "last");

        let fresh = Doc::new();
        fresh
            .transact_mut()
            .apply_update(Update::decode_v1(&rows[0].update).unwrap())
            .unwrap();
        let fresh_text = fresh.get_or_insert_text("content");
        assert_eq!(fresh_text.get_string(&fresh.transact()), "ABC");
    }

    #[tokio::test]
    async fn test_compaction_skips_documents_without_rows() {
        let (log, repo) = log_with(vec![record("base", None), record("doc", Some("base"))]).await;
        log.append_update("base", &user("u"), b"base").await.unwrap();

        assert_eq!(log.compact("doc", b"snapshot").await.unwrap(), Compaction::Skipped);
        assert!(repo.all_rows("doc").is_empty());
    }
}
