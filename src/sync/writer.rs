//! Sequential persistence writer owned by one document actor.
//!
//! Appends and meta writes are queued in arrival order and executed one at
//! a time on a separate task, so a slow database never stalls the actor's
//! broadcast path. Failures are logged and counted; the in-memory merge that
//! produced a write is never rolled back.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{DocumentId, UserId};
use crate::storage::UpdateLog;

/// Process-wide persistence counters
#[derive(Debug, Default)]
pub struct PersistenceStats {
    persisted_updates: AtomicU64,
    meta_writes: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceStats {
    pub fn persisted_updates(&self) -> u64 {
        self.persisted_updates.load(Ordering::Relaxed)
    }

    pub fn meta_writes(&self) -> u64 {
        self.meta_writes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

enum PersistJob {
    Append { user_id: UserId, update: Vec<u8> },
    Meta(Value),
}

pub(crate) struct PersistenceWriter {
    tx: mpsc::UnboundedSender<PersistJob>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    pub(crate) fn spawn(document_id: DocumentId, log: UpdateLog, stats: Arc<PersistenceStats>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    PersistJob::Append { user_id, update } => {
                        match log.append_update(&document_id, &user_id, &update).await {
                            Ok(seq) => {
                                stats.persisted_updates.fetch_add(1, Ordering::Relaxed);
                                debug!("Persisted update {} for {} by {}", seq, document_id, user_id);
                            }
                            Err(e) => {
                                stats.failures.fetch_add(1, Ordering::Relaxed);
                                error!("Failed to persist update for {}: {}", document_id, e);
                            }
                        }
                    }
                    PersistJob::Meta(meta) => {
                        match log.repository().update_meta(&document_id, &meta).await {
                            Ok(()) => {
                                stats.meta_writes.fetch_add(1, Ordering::Relaxed);
                                debug!("Projected meta for {}", document_id);
                            }
                            Err(e) => {
                                stats.failures.fetch_add(1, Ordering::Relaxed);
                                error!("Failed to project meta for {}: {}", document_id, e);
                            }
                        }
                    }
                }
            }
        });

        Self { tx, task }
    }

    pub(crate) fn append(&self, user_id: UserId, update: Vec<u8>) {
        if self.tx.send(PersistJob::Append { user_id, update }).is_err() {
            error!("Persistence writer gone; update dropped");
        }
    }

    pub(crate) fn write_meta(&self, meta: Value) {
        if self.tx.send(PersistJob::Meta(meta)).is_err() {
            error!("Persistence writer gone; meta write dropped");
        }
    }

    /// Close the queue and wait until every queued job has run
    pub(crate) async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!("Persistence writer task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DocumentKind, DocumentRecord, DocumentRepository, MemoryRepository};
    use serde_json::json;

    #[tokio::test]
    async fn test_jobs_run_in_order_and_are_counted() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put_document(&DocumentRecord::new("d", DocumentKind::Presentation, "D"))
            .await
            .unwrap();
        let stats = Arc::new(PersistenceStats::default());
        let writer =
            PersistenceWriter::spawn("d".to_string(), UpdateLog::new(repo.clone()), stats.clone());

        let user = UserId::new("u").unwrap();
        for i in 0..3u8 {
            writer.append(user.clone(), vec![i]);
        }
        writer.write_meta(json!({"title": "T"}));
        writer.finish().await;

        let payloads: Vec<u8> = repo.all_rows("d").iter().map(|r| r.update[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2]);
        assert_eq!(stats.persisted_updates(), 3);
        assert_eq!(stats.meta_writes(), 1);
        assert_eq!(stats.failures(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(PersistenceStats::default());
        let writer =
            PersistenceWriter::spawn("d".to_string(), UpdateLog::new(repo.clone()), stats.clone());

        repo.set_fail_writes(true);
        writer.append(UserId::new("u").unwrap(), vec![1]);
        // Missing record
        writer.write_meta(json!({}));
        writer.finish().await;

        assert_eq!(stats.failures(), 2);
        assert_eq!(stats.persisted_updates(), 0);
    }
}
