//! Yrs document wrapper for collaborative editing.
//!
//! A [`CollabDocument`] is owned by exactly one document actor. It exposes
//! the handful of operations the sync protocol needs (merge, state vector,
//! diff) plus by-value reads of the shared structures the server projects:
//! the `meta` map and, for events, the `channels` array.

use serde_json::Value as JsonValue;
use thiserror::Error;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use super::bounds;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    Decode(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),

    #[error("Invalid meta snapshot: {0}")]
    Meta(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Root-level shared type names
pub mod keys {
    pub const META: &str = "meta";
    pub const CHANNELS: &str = "channels";
    pub const CONTENT: &str = "content";
}

/// What merging an update changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The `meta` map differs from before the merge
    pub meta_changed: bool,
}

/// Authoritative in-memory replica of one document
pub struct CollabDocument {
    doc: Doc,
    meta: MapRef,
    document_id: String,
}

impl CollabDocument {
    /// Create a new empty document
    pub fn new(document_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let meta = doc.get_or_insert_map(keys::META);
        Self {
            doc,
            meta,
            document_id: document_id.into(),
        }
    }

    /// Get the document ID
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Merge a v1-encoded update. Idempotent and order-independent.
    pub fn apply_update(&mut self, update: &[u8]) -> DocumentResult<MergeOutcome> {
        bounds::check_update(update).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;

        let before = self.meta_any();
        self.doc
            .transact_mut()
            .apply_update(decoded)
            .map_err(|e| DocumentError::Apply(e.to_string()))?;
        let after = self.meta_any();

        Ok(MergeOutcome {
            meta_changed: before != after,
        })
    }

    /// Current state vector
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encoded state vector, for diagnostics
    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Minimal update bringing a peer at `remote` up to date
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(remote)
    }

    /// Full state as a single update
    pub fn encode_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    /// Whether the `meta` map has no keys
    pub fn meta_is_empty(&self) -> bool {
        self.meta.len(&self.doc.transact()) == 0
    }

    /// The `meta` map as JSON
    pub fn meta_json(&self) -> DocumentResult<JsonValue> {
        any_to_json(&self.meta_any())
    }

    /// Populate `meta` from a relational snapshot, only if it has no keys.
    ///
    /// Replayed history always wins: a non-empty map is left untouched.
    /// Returns the number of keys written.
    pub fn seed_meta(&mut self, snapshot: &JsonValue) -> DocumentResult<usize> {
        if !self.meta_is_empty() {
            return Ok(0);
        }
        let Some(entries) = snapshot.as_object() else {
            return match snapshot {
                JsonValue::Null => Ok(0),
                other => Err(DocumentError::Meta(format!(
                    "expected object, got {}",
                    other
                ))),
            };
        };

        let mut values = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let any: Any = serde_json::from_value(value.clone())
                .map_err(|e| DocumentError::Meta(format!("{}: {}", key, e)))?;
            values.push((key.clone(), any));
        }

        let mut txn = self.doc.transact_mut();
        for (key, any) in &values {
            self.meta.insert(&mut txn, key.as_str(), any.clone());
        }
        Ok(values.len())
    }

    /// The event `channels` array as JSON (`[]` when absent)
    pub fn channels_json(&self) -> DocumentResult<JsonValue> {
        let channels = self.doc.get_or_insert_array(keys::CHANNELS);
        let any = channels.to_json(&self.doc.transact());
        any_to_json(&any)
    }

    fn meta_any(&self) -> Any {
        self.meta.to_json(&self.doc.transact())
    }
}

fn any_to_json(any: &Any) -> DocumentResult<JsonValue> {
    serde_json::to_value(any).map_err(|e| DocumentError::Meta(e.to_string()))
}
