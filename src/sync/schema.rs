//! Typed schemas for the shared structures the server reads.
//!
//! Clients write loosely-typed values into the CRDT. The server never trusts
//! those values at read sites; it reconstructs them by value at this boundary
//! and validates them against the document kind:
//! - [`DocumentMeta`] for the `meta` map of every document
//! - [`EventProgram`] for the `channels` array of event documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::storage::DocumentKind;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid {kind:?} meta: {reason}")]
    InvalidMeta { kind: DocumentKind, reason: String },

    #[error("Invalid event channels: {0}")]
    InvalidChannels(String),

    #[error("Event ends before it starts")]
    InvertedSchedule,
}

/// `meta` of a presentation document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub color_overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub font_overrides: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `meta` of a theme document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub colors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fonts: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `meta` of an event document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Validated `meta` map, tagged by document kind
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMeta {
    Presentation(PresentationMeta),
    Theme(ThemeMeta),
    Event(EventMeta),
}

impl DocumentMeta {
    /// Validate a JSON meta map against the schema for `kind`
    pub fn from_json(kind: DocumentKind, value: Value) -> Result<Self, SchemaError> {
        let invalid = |e: serde_json::Error| SchemaError::InvalidMeta {
            kind,
            reason: e.to_string(),
        };

        let meta = match kind {
            DocumentKind::Presentation => {
                DocumentMeta::Presentation(serde_json::from_value(value).map_err(invalid)?)
            }
            DocumentKind::Theme => {
                DocumentMeta::Theme(serde_json::from_value(value).map_err(invalid)?)
            }
            DocumentKind::Event => {
                let event: EventMeta = serde_json::from_value(value).map_err(invalid)?;
                if let (Some(starts), Some(ends)) = (event.starts_at, event.ends_at) {
                    if ends < starts {
                        return Err(SchemaError::InvertedSchedule);
                    }
                }
                DocumentMeta::Event(event)
            }
        };
        Ok(meta)
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentMeta::Presentation(_) => DocumentKind::Presentation,
            DocumentMeta::Theme(_) => DocumentKind::Theme,
            DocumentMeta::Event(_) => DocumentKind::Event,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self {
            DocumentMeta::Presentation(meta) => meta.title.as_deref(),
            DocumentMeta::Theme(meta) => meta.name.as_deref(),
            DocumentMeta::Event(meta) => meta.title.as_deref(),
        }
    }

    /// Serialize back into the JSON stored in the document record
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            DocumentMeta::Presentation(meta) => serde_json::to_value(meta),
            DocumentMeta::Theme(meta) => serde_json::to_value(meta),
            DocumentMeta::Event(meta) => serde_json::to_value(meta),
        }
    }
}

/// Stable identifier of a record in an [`EventProgram`]
pub type RecordId = String;

/// One channel of an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: RecordId,
    pub name: Option<String>,
    /// Assignments in channel order
    pub assignment_ids: Vec<RecordId>,
}

/// A presentation scheduled on a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub id: RecordId,
    pub channel_id: RecordId,
    pub presentation_id: String,
    pub starts_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChannel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    presentations: Vec<RawAssignment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAssignment {
    #[serde(default)]
    id: Option<String>,
    presentation_id: String,
    #[serde(default)]
    starts_at: Option<DateTime<Utc>>,
}

/// Event channels reconstructed as an arena of typed records.
///
/// Records reference each other by id only; the live CRDT arrays are never
/// held past reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProgram {
    channels: Vec<ChannelRecord>,
    assignments: Vec<AssignmentRecord>,
    #[serde(skip)]
    channel_index: HashMap<RecordId, usize>,
    #[serde(skip)]
    assignment_index: HashMap<RecordId, usize>,
}

impl EventProgram {
    /// Rebuild from the JSON form of the `channels` array.
    ///
    /// Records without an `id` get a generated one; duplicate ids are an
    /// error since they would make references ambiguous.
    pub fn from_json(value: Value) -> Result<Self, SchemaError> {
        let raw: Vec<RawChannel> = match value {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other)
                .map_err(|e| SchemaError::InvalidChannels(e.to_string()))?,
        };

        let mut program = EventProgram::default();
        for channel in raw {
            let channel_id = channel.id.unwrap_or_else(generate_id);
            if program.channel_index.contains_key(&channel_id) {
                return Err(SchemaError::InvalidChannels(format!(
                    "duplicate channel id {}",
                    channel_id
                )));
            }

            let mut assignment_ids = Vec::with_capacity(channel.presentations.len());
            for assignment in channel.presentations {
                let id = assignment.id.unwrap_or_else(generate_id);
                if program.assignment_index.contains_key(&id) {
                    return Err(SchemaError::InvalidChannels(format!(
                        "duplicate assignment id {}",
                        id
                    )));
                }
                program
                    .assignment_index
                    .insert(id.clone(), program.assignments.len());
                program.assignments.push(AssignmentRecord {
                    id: id.clone(),
                    channel_id: channel_id.clone(),
                    presentation_id: assignment.presentation_id,
                    starts_at: assignment.starts_at,
                });
                assignment_ids.push(id);
            }

            program
                .channel_index
                .insert(channel_id.clone(), program.channels.len());
            program.channels.push(ChannelRecord {
                id: channel_id,
                name: channel.name,
                assignment_ids,
            });
        }
        Ok(program)
    }

    pub fn channels(&self) -> &[ChannelRecord] {
        &self.channels
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelRecord> {
        self.channel_index.get(id).map(|&i| &self.channels[i])
    }

    pub fn assignment(&self, id: &str) -> Option<&AssignmentRecord> {
        self.assignment_index.get(id).map(|&i| &self.assignments[i])
    }

    /// Assignments of one channel, in channel order
    pub fn assignments_for<'a>(
        &'a self,
        channel_id: &str,
    ) -> impl Iterator<Item = &'a AssignmentRecord> + 'a {
        self.channel(channel_id)
            .into_iter()
            .flat_map(|channel| channel.assignment_ids.iter())
            .filter_map(|id| self.assignment(id))
    }

    /// Distinct presentations referenced anywhere in the program
    pub fn presentation_ids(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.assignments
            .iter()
            .map(|a| a.presentation_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn generate_id() -> RecordId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presentation_meta_keeps_unknown_keys() {
        let meta = DocumentMeta::from_json(
            DocumentKind::Presentation,
            json!({"title": "Deck", "themeId": "t-1", "aspect": "16:9"}),
        )
        .unwrap();

        assert_eq!(meta.title(), Some("Deck"));
        let DocumentMeta::Presentation(ref inner) = meta else {
            panic!("expected presentation meta");
        };
        assert_eq!(inner.theme_id.as_deref(), Some("t-1"));
        assert_eq!(inner.extra["aspect"], "16:9");

        let round = meta.to_json().unwrap();
        assert_eq!(round["aspect"], "16:9");
        assert_eq!(round["themeId"], "t-1");
    }

    #[test]
    fn test_meta_type_mismatch_is_rejected() {
        let result = DocumentMeta::from_json(DocumentKind::Presentation, json!({"title": 42}));
        assert!(matches!(result, Err(SchemaError::InvalidMeta { .. })));

        let result = DocumentMeta::from_json(DocumentKind::Theme, json!({"colors": "red"}));
        assert!(matches!(result, Err(SchemaError::InvalidMeta { .. })));
    }

    #[test]
    fn test_event_schedule_validation() {
        let ok = DocumentMeta::from_json(
            DocumentKind::Event,
            json!({"title": "Conf", "startsAt": "2026-05-01T09:00:00Z", "endsAt": "2026-05-01T17:00:00Z"}),
        )
        .unwrap();
        assert_eq!(ok.kind(), DocumentKind::Event);

        let inverted = DocumentMeta::from_json(
            DocumentKind::Event,
            json!({"startsAt": "2026-05-01T17:00:00Z", "endsAt": "2026-05-01T09:00:00Z"}),
        );
        assert!(matches!(inverted, Err(SchemaError::InvertedSchedule)));
    }

    #[test]
    fn test_event_program_arena() {
        let program = EventProgram::from_json(json!([
            {"id": "main", "name": "Main stage", "presentations": [
                {"id": "a1", "presentationId": "p-1"},
                {"id": "a2", "presentationId": "p-2", "startsAt": "2026-05-01T10:00:00Z"}
            ]},
            {"name": "Side", "presentations": [
                {"presentationId": "p-1"}
            ]}
        ]))
        .unwrap();

        assert_eq!(program.channels().len(), 2);
        let main: Vec<&str> = program
            .assignments_for("main")
            .map(|a| a.presentation_id.as_str())
            .collect();
        assert_eq!(main, vec!["p-1", "p-2"]);
        assert_eq!(program.assignment("a2").unwrap().channel_id, "main");
        assert_eq!(program.presentation_ids(), vec!["p-1", "p-2"]);

        // Generated ids still link records together
        let side = &program.channels()[1];
        assert!(!side.id.is_empty());
        assert_eq!(program.assignments_for(&side.id).count(), 1);
    }

    #[test]
    fn test_event_program_rejects_duplicates_and_garbage() {
        let dup = EventProgram::from_json(json!([{"id": "c"}, {"id": "c"}]));
        assert!(matches!(dup, Err(SchemaError::InvalidChannels(_))));

        let garbage = EventProgram::from_json(json!({"not": "an array"}));
        assert!(matches!(garbage, Err(SchemaError::InvalidChannels(_))));

        assert!(EventProgram::from_json(Value::Null).unwrap().is_empty());
        assert!(EventProgram::from_json(json!([])).unwrap().is_empty());
    }
}
