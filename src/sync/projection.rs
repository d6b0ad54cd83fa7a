//! Debounced projection of the CRDT `meta` map into the document record.
//!
//! The actor owns one [`MetaProjection`]. Every merge that touches `meta`
//! pushes the deadline out; the actor's loop sleeps until the deadline and
//! then writes the validated map once. Termination flushes whatever is
//! still pending.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use super::schema::{DocumentMeta, SchemaError};
use crate::storage::DocumentKind;

/// Default quiet period before a meta write
pub const DEFAULT_META_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct MetaProjection {
    kind: DocumentKind,
    delay: Duration,
    deadline: Option<Instant>,
}

impl MetaProjection {
    pub fn new(kind: DocumentKind, delay: Duration) -> Self {
        Self {
            kind,
            delay,
            deadline: None,
        }
    }

    /// Record a meta mutation at `now`, restarting the quiet period
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Clear the pending write if its deadline has passed
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Clear the pending write regardless of its deadline
    pub fn take_pending(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Validate the live meta map and produce the JSON to store
    pub fn project(&self, meta: Value) -> Result<Value, SchemaError> {
        let typed = DocumentMeta::from_json(self.kind, meta)?;
        typed.to_json().map_err(|e| SchemaError::InvalidMeta {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}
