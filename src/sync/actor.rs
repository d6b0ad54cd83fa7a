//! Document actor: the single owner of one document's live CRDT state.
//!
//! Every mutation of a document happens on its actor's task, one command at
//! a time. Connections talk to the actor only through a [`DocumentHandle`];
//! nothing outside this module ever sees the [`CollabDocument`].
//!
//! Lifecycle:
//! - Loading: replay the resolved history, seed `meta` from the record
//! - Active: serve registrations, frames and diagnostic queries
//! - Terminating: close the mailbox, drain it, flush the pending meta
//!   projection, wait for queued writes, compact, exit

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use yrs::StateVector;

use super::document::CollabDocument;
use super::projection::MetaProjection;
use super::protocol::{Message, SyncMessage, SyncProtocol};
use super::registry::ActorLease;
use super::schema::EventProgram;
use super::writer::{PersistenceStats, PersistenceWriter};
use super::{DocumentId, ObserverId, Permission, SyncError, SyncResult, UserId};
use crate::config::ActorConfig;
use crate::storage::update_log::Compaction;
use crate::storage::{DocumentKind, UpdateLog};

/// Outbound frames for one observer
pub type ObserverSink = mpsc::UnboundedSender<Bytes>;

/// v1 encoding of an update with no blocks and no deletions
const EMPTY_UPDATE: [u8; 2] = [0, 0];

enum Command {
    Register {
        sink: ObserverSink,
        user_id: Option<UserId>,
        permission: Permission,
        reply: oneshot::Sender<SyncResult<ObserverRegistration>>,
    },
    Deregister {
        observer_id: ObserverId,
    },
    Frame {
        observer_id: ObserverId,
        frame: Bytes,
    },
    StateVector {
        reply: oneshot::Sender<StateVector>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentSnapshot>,
    },
    Shutdown,
}

/// Outcome of a successful registration
#[derive(Debug, Clone)]
pub struct ObserverRegistration {
    pub observer_id: ObserverId,
    pub document_id: DocumentId,
    pub permission: Permission,
    /// Whether this observer's deltas are merged and persisted
    pub can_write: bool,
}

/// By-value copy of an actor's state for diagnostics and tests
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub kind: DocumentKind,
    pub observers: usize,
    pub state_vector: Vec<u8>,
    pub state: Vec<u8>,
    pub meta: Value,
    /// Reconstructed channels, for event documents
    pub program: Option<EventProgram>,
}

/// Cloneable address of a live document actor
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    tx: mpsc::UnboundedSender<Command>,
    observers: Arc<AtomicUsize>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The actor has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    /// Whether both handles address the same actor instance
    pub fn same_actor(&self, other: &DocumentHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Add an observer. The actor immediately sends it a SyncStep1.
    ///
    /// Fails with [`SyncError::ActorTerminating`] if the actor is shutting
    /// down; the caller should look the document up again.
    pub async fn register(
        &self,
        sink: ObserverSink,
        user_id: Option<UserId>,
        permission: Permission,
    ) -> SyncResult<ObserverRegistration> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                sink,
                user_id,
                permission,
                reply,
            })
            .map_err(|_| self.terminating())?;
        rx.await.map_err(|_| self.terminating())?
    }

    pub fn deregister(&self, observer_id: ObserverId) {
        let _ = self.tx.send(Command::Deregister { observer_id });
    }

    /// Queue one inbound transport frame from an observer
    pub fn send_frame(&self, observer_id: ObserverId, frame: Bytes) -> SyncResult<()> {
        self.tx
            .send(Command::Frame { observer_id, frame })
            .map_err(|_| self.unavailable())
    }

    pub async fn state_vector(&self) -> SyncResult<StateVector> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StateVector { reply })
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn snapshot(&self) -> SyncResult<DocumentSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Ask the actor to terminate even though observers remain
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    fn terminating(&self) -> SyncError {
        SyncError::ActorTerminating(self.document_id.clone())
    }

    fn unavailable(&self) -> SyncError {
        SyncError::ActorUnavailable(self.document_id.clone())
    }
}

struct Observer {
    user_id: Option<UserId>,
    permission: Permission,
    sink: ObserverSink,
    /// Deregisters the observer once its sink closes
    monitor: JoinHandle<()>,
}

impl Observer {
    /// Attribution for this observer's deltas, if it may write
    fn writer(&self) -> Option<&UserId> {
        match self.permission {
            Permission::ReadWrite => self.user_id.as_ref(),
            Permission::ReadOnly => None,
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

enum Flow {
    Continue,
    Stop,
}

struct DocumentActor {
    document_id: DocumentId,
    kind: DocumentKind,
    doc: CollabDocument,
    observers: HashMap<ObserverId, Observer>,
    observer_count: Arc<AtomicUsize>,
    projection: MetaProjection,
    writer: PersistenceWriter,
    log: UpdateLog,
    config: ActorConfig,
    /// Own mailbox, for observer monitors
    mailbox: mpsc::UnboundedSender<Command>,
    idle_deadline: Option<Instant>,
    /// Something was appended since load; compaction is worthwhile
    dirty: bool,
}

/// Start an actor task for `document_id`. The task owns `lease` until it
/// exits, however it exits.
pub(crate) fn spawn(
    document_id: DocumentId,
    log: UpdateLog,
    config: ActorConfig,
    stats: Arc<PersistenceStats>,
    lease: ActorLease,
) -> DocumentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let observers = Arc::new(AtomicUsize::new(0));
    let handle = DocumentHandle {
        document_id: document_id.clone(),
        tx: tx.clone(),
        observers: observers.clone(),
    };

    tokio::spawn(async move {
        let _lease = lease;
        match load(&document_id, &log).await {
            Ok((kind, doc)) => {
                let actor = DocumentActor {
                    projection: MetaProjection::new(kind, config.meta_debounce),
                    writer: PersistenceWriter::spawn(document_id.clone(), log.clone(), stats),
                    document_id,
                    kind,
                    doc,
                    observers: HashMap::new(),
                    observer_count: observers,
                    log,
                    config,
                    mailbox: tx,
                    idle_deadline: None,
                    dirty: false,
                };
                actor.run(rx).await;
            }
            Err(e) => {
                warn!("Failed to load document {}: {}", document_id, e);
                reject_pending(rx, e).await;
            }
        }
    });

    handle
}

/// Replay the resolved history into a fresh document, then seed `meta`
/// from the record only if replay left it empty.
async fn load(document_id: &str, log: &UpdateLog) -> SyncResult<(DocumentKind, CollabDocument)> {
    let record = log
        .repository()
        .select_document(document_id)
        .await?
        .filter(|record| !record.is_deleted())
        .ok_or_else(|| SyncError::DocumentNotFound(document_id.to_string()))?;

    let history = log.load_resolved_history(document_id).await?;
    let mut doc = CollabDocument::new(document_id);
    let mut rejected = 0;
    for update in &history {
        if let Err(e) = doc.apply_update(update) {
            rejected += 1;
            warn!("Skipping unreadable update for {}: {}", document_id, e);
        }
    }

    match doc.seed_meta(&record.meta) {
        Ok(0) => {}
        Ok(keys) => debug!("Seeded {} meta keys for {} from record", keys, document_id),
        Err(e) => warn!("Ignoring stored meta for {}: {}", document_id, e),
    }

    info!(
        "Loaded document {} from {} updates ({} rejected)",
        document_id,
        history.len(),
        rejected
    );
    Ok((record.kind, doc))
}

async fn reject_pending(mut rx: mpsc::UnboundedReceiver<Command>, error: SyncError) {
    rx.close();
    while let Some(command) = rx.recv().await {
        if let Command::Register { reply, .. } = command {
            let _ = reply.send(Err(error.clone()));
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl DocumentActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Document actor started: {}", self.document_id);
        self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);

        loop {
            let meta_deadline = self.projection.deadline();
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => {
                            if let Flow::Stop = self.handle(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sleep_until_opt(meta_deadline) => {
                    if self.projection.take_due(Instant::now()) {
                        self.write_meta();
                    }
                }
                _ = sleep_until_opt(idle_deadline) => {
                    info!("Document actor {} idle with no observers", self.document_id);
                    break;
                }
            }
        }

        self.terminate(rx).await;
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Register {
                sink,
                user_id,
                permission,
                reply,
            } => {
                self.register(sink, user_id, permission, reply);
                Flow::Continue
            }
            Command::Deregister { observer_id } => self.deregister(observer_id),
            Command::Frame { observer_id, frame } => {
                self.handle_frame(observer_id, &frame);
                Flow::Continue
            }
            Command::StateVector { reply } => {
                let _ = reply.send(self.doc.state_vector());
                Flow::Continue
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            Command::Shutdown => {
                info!(
                    "Shutdown requested for {} with {} observers",
                    self.document_id,
                    self.observers.len()
                );
                Flow::Stop
            }
        }
    }

    fn register(
        &mut self,
        sink: ObserverSink,
        user_id: Option<UserId>,
        permission: Permission,
        reply: oneshot::Sender<SyncResult<ObserverRegistration>>,
    ) {
        let observer_id = ObserverId::new_v4();

        // Server half of the handshake: ask the client for what it has
        let _ = sink.send(SyncProtocol::sync_step1(self.doc.state_vector()));

        let monitor = {
            let sink = sink.clone();
            let mailbox = self.mailbox.clone();
            tokio::spawn(async move {
                sink.closed().await;
                let _ = mailbox.send(Command::Deregister { observer_id });
            })
        };

        let observer = Observer {
            user_id,
            permission,
            sink,
            monitor,
        };
        let registration = ObserverRegistration {
            observer_id,
            document_id: self.document_id.clone(),
            permission,
            can_write: observer.writer().is_some(),
        };
        debug!(
            "Observer {} registered on {} (user={:?}, writer={})",
            observer_id, self.document_id, observer.user_id, registration.can_write
        );

        self.observers.insert(observer_id, observer);
        self.idle_deadline = None;
        self.observer_count
            .store(self.observers.len(), Ordering::SeqCst);

        if reply.send(Ok(registration)).is_err() {
            debug!("Registrant for {} went away; dropping observer", self.document_id);
            self.observers.remove(&observer_id);
            self.observer_count
                .store(self.observers.len(), Ordering::SeqCst);
            if self.observers.is_empty() {
                self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
            }
        }
    }

    fn deregister(&mut self, observer_id: ObserverId) -> Flow {
        if self.observers.remove(&observer_id).is_none() {
            return Flow::Continue;
        }
        self.observer_count
            .store(self.observers.len(), Ordering::SeqCst);
        debug!("Observer {} left {}", observer_id, self.document_id);

        if self.observers.is_empty() {
            info!("Last observer left {}; terminating", self.document_id);
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn handle_frame(&mut self, observer_id: ObserverId, frame: &[u8]) {
        let Some(observer) = self.observers.get(&observer_id) else {
            debug!("Frame from unknown observer {} on {}", observer_id, self.document_id);
            return;
        };
        let writer = observer.writer().cloned();

        let messages = match SyncProtocol::decode_frame(frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(
                    "Dropping malformed frame from {} on {}: {}",
                    observer_id, self.document_id, e
                );
                return;
            }
        };

        for message in messages {
            match message {
                Message::Sync(SyncMessage::SyncStep1(remote)) => {
                    let diff = self.doc.encode_diff(&remote);
                    self.send_to(&observer_id, SyncProtocol::sync_step2(diff));
                }
                Message::Sync(SyncMessage::SyncStep2(update))
                | Message::Sync(SyncMessage::Update(update)) => {
                    self.apply_delta(observer_id, writer.as_ref(), update);
                }
                Message::Awareness(_) | Message::QueryAwareness => {
                    debug!("Ignoring awareness message on {}", self.document_id);
                }
                Message::Auth(reason) => {
                    debug!("Ignoring auth message on {}: {}", self.document_id, reason);
                }
            }
        }
    }

    /// Merge, persist and relay one delta
    fn apply_delta(&mut self, sender: ObserverId, writer: Option<&UserId>, update: Vec<u8>) {
        let Some(user_id) = writer else {
            debug!(
                "Dropping delta from non-writer {} on {}",
                sender, self.document_id
            );
            return;
        };
        if update == EMPTY_UPDATE {
            return;
        }

        let outcome = match self.doc.apply_update(&update) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Rejected delta from {} on {}: {}",
                    sender, self.document_id, e
                );
                return;
            }
        };

        self.writer.append(user_id.clone(), update.clone());
        self.dirty = true;
        if outcome.meta_changed {
            self.projection.touch(Instant::now());
        }

        self.broadcast(sender, SyncProtocol::update(update));
    }

    fn send_to(&self, observer_id: &ObserverId, frame: Bytes) {
        if let Some(observer) = self.observers.get(observer_id) {
            let _ = observer.sink.send(frame);
        }
    }

    fn broadcast(&self, sender: ObserverId, frame: Bytes) {
        for (observer_id, observer) in &self.observers {
            if *observer_id != sender {
                let _ = observer.sink.send(frame.clone());
            }
        }
    }

    fn write_meta(&self) {
        let meta = match self.doc.meta_json() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Cannot read meta of {}: {}", self.document_id, e);
                return;
            }
        };
        match self.projection.project(meta) {
            Ok(projected) => self.writer.write_meta(projected),
            Err(e) => warn!("Not projecting meta of {}: {}", self.document_id, e),
        }
    }

    fn event_program(&self) -> Option<EventProgram> {
        if self.kind != DocumentKind::Event {
            return None;
        }
        let channels = match self.doc.channels_json() {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Cannot read channels of {}: {}", self.document_id, e);
                return None;
            }
        };
        match EventProgram::from_json(channels) {
            Ok(program) => Some(program),
            Err(e) => {
                warn!("Invalid channels in {}: {}", self.document_id, e);
                None
            }
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        let meta = self.doc.meta_json().unwrap_or_else(|e| {
            warn!("Cannot read meta of {}: {}", self.document_id, e);
            Value::Null
        });
        DocumentSnapshot {
            document_id: self.document_id.clone(),
            kind: self.kind,
            observers: self.observers.len(),
            state_vector: self.doc.encoded_state_vector(),
            state: self.doc.encode_state(),
            meta,
            program: self.event_program(),
        }
    }

    async fn terminate(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        // From here on new commands are refused; buffered ones still run
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { reply, .. } => {
                    let _ = reply.send(Err(SyncError::ActorTerminating(
                        self.document_id.clone(),
                    )));
                }
                other => {
                    let _ = self.handle(other);
                }
            }
        }

        if self.projection.take_pending() {
            self.write_meta();
        }

        self.observers.clear();
        self.observer_count.store(0, Ordering::SeqCst);

        let snapshot = self.doc.encode_state();
        self.writer.finish().await;

        if self.config.compact_on_shutdown && self.dirty {
            match self.log.compact(&self.document_id, &snapshot).await {
                Ok(Compaction::Compacted { replaced, seq }) => debug!(
                    "Terminal compaction of {} replaced {} rows with {}",
                    self.document_id, replaced, seq
                ),
                Ok(Compaction::Skipped) => {}
                Err(e) => error!("Compaction failed for {}: {}", self.document_id, e),
            }
        }

        info!("Document actor stopped: {}", self.document_id);
    }
}
