//! Doc Sync Server - authoritative CRDT synchronization per document
//!
//! A collaboration backend using:
//! - Yrs (Yjs) CRDTs with the y-websocket binary sync protocol
//! - One supervised actor per open document for lock-free serialization
//! - An append-only update log in Sled with base-document inheritance
//! - Axum with WebSocket for the client transport

pub mod config;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::{ActorConfig, ServerConfig, StorageBackend};
pub use server::{router, AppState};
pub use storage::{DocumentRepository, MemoryRepository, SledRepository, UpdateLog};
pub use sync::{ActorRegistry, RecordAccessPolicy};
