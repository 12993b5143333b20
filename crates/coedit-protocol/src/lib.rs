use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for one connected editing session.
pub type SessionId = String;

/// Identifier of one row of an entity kind.
pub type RowId = String;

/// Bus topic for an entity kind. One topic per kind.
pub fn topic_for(entity: &str) -> String {
    format!("live:{entity}")
}

/// Inverse of [`topic_for`]: the entity kind a topic belongs to.
pub fn entity_for_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix("live:")
}

/// Identifies one editable field on one row of one entity kind.
///
/// Used purely as a map key for edit locks and drafts; no ordering
/// semantics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub entity: String,
    pub row_id: RowId,
    pub field: String,
}

impl LockKey {
    pub fn new(
        entity: impl Into<String>,
        row_id: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            row_id: row_id.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity, self.row_id, self.field)
    }
}

/// Client-to-server commands sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Rebuild and return the full row snapshot for an entity kind.
    Snapshot {
        entity: String,
    },
    /// Start receiving change notifications for an entity kind.
    Subscribe {
        entity: String,
    },

    // Field editing
    StartEdit {
        entity: String,
        row_id: RowId,
        field: String,
    },
    UpdateDraft {
        entity: String,
        row_id: RowId,
        field: String,
        value: String,
    },
    SaveEdit {
        entity: String,
        row_id: RowId,
        field: String,
    },
    CancelEdit {
        entity: String,
        row_id: RowId,
        field: String,
    },

    // Item management
    CreateItem {
        entity: String,
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
    DeleteItem {
        entity: String,
        row_id: RowId,
    },
    MoveItem {
        entity: String,
        row_id: RowId,
        direction: i64,
    },
    MoveToPosition {
        entity: String,
        row_id: RowId,
        position: usize,
    },
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(Notification),
}

/// A change notification fanned out to every subscriber of a topic.
///
/// Ephemeral and best-effort: no replay, no acknowledgement. Subscribers
/// treat any received event as "re-derive visible state from the store",
/// never as an incremental diff.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Notification {
    pub topic: String,
    #[serde(flatten)]
    pub event: NotifyEvent,
}

/// Action carried by a [`Notification`].
///
/// Unrecognized actions deserialize to [`NotifyEvent::Unknown`] and are
/// ignored by receivers rather than treated as an error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotifyEvent {
    StateChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_id: Option<RowId>,
    },
    ItemCreated {
        row_id: RowId,
    },
    ItemDeleted {
        row_id: RowId,
    },
    LocksReleased {
        keys: Vec<LockKey>,
    },
    /// Forced cancellation of one session's in-progress edit on `key`.
    Conflict {
        key: LockKey,
    },
    #[serde(other)]
    Unknown,
}

/// Per-field rendering tuple consumed by the display layer.
///
/// The display layer never mutates lock or draft state; everything it
/// needs to pick a representation is here.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldView {
    pub value: String,
    pub is_editing: bool,
    #[serde(default)]
    pub draft_value: String,
    pub is_locked_by_other: bool,
}

/// One rendered row: title plus the per-field view tuples.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RowView {
    pub id: RowId,
    pub title: String,
    pub fields: BTreeMap<String, FieldView>,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EntityNotFound,
    RowNotFound,
    FieldNotEditable,
    WriteRejected,
    InvalidRequest,
    ServerError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tag_format() {
        let cmd = Command::Snapshot {
            entity: "card".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"cmd":"snapshot","entity":"card"}"#);
    }

    #[test]
    fn command_start_edit_roundtrip() {
        let cmd = Command::StartEdit {
            entity: "card".to_string(),
            row_id: "42".to_string(),
            field: "title".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: Command = serde_json::from_str(&json).unwrap();
        match parsed {
            Command::StartEdit { entity, row_id, field } => {
                assert_eq!(entity, "card");
                assert_eq!(row_id, "42");
                assert_eq!(field, "title");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn create_item_values_default() {
        let json = r#"{"cmd":"create_item","entity":"card"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::CreateItem { values, .. } => assert!(values.is_empty()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn notification_flattens_action() {
        let n = Notification {
            topic: topic_for("card"),
            event: NotifyEvent::StateChanged {
                row_id: Some("7".to_string()),
            },
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(
            json,
            r#"{"topic":"live:card","action":"state_changed","row_id":"7"}"#
        );
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.topic, "live:card");
        assert_eq!(
            parsed.event,
            NotifyEvent::StateChanged {
                row_id: Some("7".to_string())
            }
        );
    }

    #[test]
    fn unknown_action_is_tolerated() {
        let json = r#"{"topic":"live:card","action":"made_up_later"}"#;
        let parsed: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.event, NotifyEvent::Unknown);
    }

    #[test]
    fn locks_released_roundtrip() {
        let n = Notification {
            topic: topic_for("card"),
            event: NotifyEvent::LocksReleased {
                keys: vec![
                    LockKey::new("card", "1", "title"),
                    LockKey::new("card", "2", "content"),
                ],
            },
        };
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("locks_released"));
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        match parsed.event {
            NotifyEvent::LocksReleased { keys } => assert_eq!(keys.len(), 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_error_roundtrip() {
        let resp = Response::Error {
            message: "row not found: 9".to_string(),
            code: ErrorCode::RowNotFound,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("row_not_found"));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::RowNotFound),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_event_roundtrip() {
        let resp = Response::Event(Notification {
            topic: topic_for("card"),
            event: NotifyEvent::Conflict {
                key: LockKey::new("card", "3", "title"),
            },
        });
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Event(n) => match n.event {
                NotifyEvent::Conflict { key } => {
                    assert_eq!(key.to_string(), "card:3:title");
                }
                _ => panic!("wrong action"),
            },
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn topic_roundtrip() {
        assert_eq!(topic_for("card"), "live:card");
        assert_eq!(entity_for_topic("live:card"), Some("card"));
        assert_eq!(entity_for_topic("other:card"), None);
    }

    #[test]
    fn lock_key_display() {
        let key = LockKey::new("widget", "42", "title");
        assert_eq!(key.to_string(), "widget:42:title");
    }

    #[test]
    fn field_view_roundtrip() {
        let view = FieldView {
            value: "Hello".to_string(),
            is_editing: true,
            draft_value: "Hello, world".to_string(),
            is_locked_by_other: false,
        };
        let json = serde_json::to_string(&view).unwrap();
        let parsed: FieldView = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, view);
    }
}
