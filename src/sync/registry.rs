//! Actor registry: the process-wide map from document id to live actor.
//!
//! This module provides:
//! - DashMap-backed lookup with exactly one live actor per document id
//! - Leases that remove an actor's entry when its task exits, even on panic
//! - Supervisor shutdown that terminates and flushes every open document

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::actor::{self, DocumentHandle, ObserverRegistration, ObserverSink};
use super::writer::PersistenceStats;
use super::{DocumentId, Permission, SyncError, SyncResult, UserId};
use crate::config::ActorConfig;
use crate::storage::UpdateLog;

/// How often a registration may race a terminating actor before giving up
const CONNECT_ATTEMPTS: usize = 5;

struct ActorEntry {
    handle: DocumentHandle,
    instance: u64,
    /// Resolves when the actor's lease is dropped
    finished: watch::Receiver<()>,
}

/// Owned by an actor task; releases the registry slot on drop
pub(crate) struct ActorLease {
    actors: Arc<DashMap<DocumentId, ActorEntry>>,
    document_id: DocumentId,
    instance: u64,
    _finished: watch::Sender<()>,
}

impl Drop for ActorLease {
    fn drop(&mut self) {
        // A newer actor may already own the slot
        let removed = self
            .actors
            .remove_if(&self.document_id, |_, entry| entry.instance == self.instance)
            .is_some();
        if removed {
            debug!(
                "Released registry slot for {} (instance {})",
                self.document_id, self.instance
            );
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_actors: usize,
    pub observers: usize,
    pub persisted_updates: u64,
    pub meta_writes: u64,
    pub persistence_failures: u64,
}

/// Finds or starts document actors and supervises their lifetimes
pub struct ActorRegistry {
    actors: Arc<DashMap<DocumentId, ActorEntry>>,
    log: UpdateLog,
    config: ActorConfig,
    stats: Arc<PersistenceStats>,
    next_instance: AtomicU64,
}

impl ActorRegistry {
    pub fn new(log: UpdateLog, config: ActorConfig) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            log,
            config,
            stats: Arc::new(PersistenceStats::default()),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Handle to the live actor for `document_id`, starting one if needed.
    ///
    /// The map entry is the mutual-exclusion point: concurrent callers all
    /// receive the same actor. If the current actor is terminating, this
    /// waits for it to release its slot and starts a fresh one.
    pub async fn find_or_start(&self, document_id: &str) -> DocumentHandle {
        loop {
            let mut finished = match self.actors.entry(document_id.to_string()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.get();
                    if !entry.handle.is_closed() {
                        return entry.handle.clone();
                    }
                    entry.finished.clone()
                }
                Entry::Vacant(vacant) => {
                    let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
                    let (finished_tx, finished_rx) = watch::channel(());
                    let lease = ActorLease {
                        actors: self.actors.clone(),
                        document_id: document_id.to_string(),
                        instance,
                        _finished: finished_tx,
                    };
                    let handle = actor::spawn(
                        document_id.to_string(),
                        self.log.clone(),
                        self.config.clone(),
                        self.stats.clone(),
                        lease,
                    );
                    vacant.insert(ActorEntry {
                        handle: handle.clone(),
                        instance,
                        finished: finished_rx,
                    });
                    info!("Started actor for {} (instance {})", document_id, instance);
                    return handle;
                }
            };

            debug!("Waiting for terminating actor of {}", document_id);
            // Errors once the lease drops its sender, which is the signal
            let _ = finished.changed().await;
        }
    }

    /// Find or start the actor and register an observer on it
    pub async fn connect(
        &self,
        document_id: &str,
        sink: ObserverSink,
        user_id: Option<UserId>,
        permission: Permission,
    ) -> SyncResult<(DocumentHandle, ObserverRegistration)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let handle = self.find_or_start(document_id).await;
            match handle
                .register(sink.clone(), user_id.clone(), permission)
                .await
            {
                Ok(registration) => return Ok((handle, registration)),
                Err(SyncError::ActorTerminating(_)) if attempt < CONNECT_ATTEMPTS => {
                    debug!(
                        "Actor for {} terminating during registration; retrying",
                        document_id
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle to the live actor, without starting one
    pub fn get(&self, document_id: &str) -> Option<DocumentHandle> {
        self.actors
            .get(document_id)
            .map(|entry| entry.handle.clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Terminate every live actor and wait until each has flushed and exited
    pub async fn shutdown_all(&self) {
        let entries: Vec<(DocumentHandle, watch::Receiver<()>)> = self
            .actors
            .iter()
            .map(|entry| (entry.handle.clone(), entry.finished.clone()))
            .collect();

        info!("Shutting down {} document actors", entries.len());
        for (handle, _) in &entries {
            handle.shutdown();
        }
        for (_, mut finished) in entries {
            let _ = finished.changed().await;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_actors: self.actors.len(),
            observers: self
                .actors
                .iter()
                .map(|entry| entry.handle.observer_count())
                .sum(),
            persisted_updates: self.stats.persisted_updates(),
            meta_writes: self.stats.meta_writes(),
            persistence_failures: self.stats.failures(),
        }
    }

    pub fn update_log(&self) -> &UpdateLog {
        &self.log
    }
}
