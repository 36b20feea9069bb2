//! JSON event protocol spoken over WebSocket text frames.
//!
//! Every frame is an adjacently tagged object:
//!
//! ```text
//! { "event": "typing-status", "data": { "roomId": "s1", "isTyping": true } }
//! ```
//!
//! Binary frames are not part of this vocabulary; they carry raw CRDT
//! awareness updates for the connection's current room (see
//! [`crate::awareness`]).
//!
//! Payloads of split updates and conflicts are opaque JSON. They are
//! checked for shape here and nowhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::activity::{ActivityEvent, ActivityKind};
use crate::conflict::{ConflictInfo, Resolution};
use crate::presence::{ActiveView, MemberProfile, PresenceSnapshot};

/// Protocol errors. All of them are reported to the sender only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

// ───────────────────────────────────────────────────────────────────
// Split updates
// ───────────────────────────────────────────────────────────────────

/// A structured change to the split, relayed to the other members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Contested attribute, e.g. `item.price`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl SplitUpdate {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            user_id: String::new(),
            timestamp: Utc::now(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// The field this update targets: `field`, else a string `payload.field`.
    pub fn field_key(&self) -> Option<&str> {
        self.field
            .as_deref()
            .or_else(|| self.payload.get("field").and_then(Value::as_str))
            .filter(|f| !f.is_empty())
    }

    /// Value written to the field: `payload.value` if present, else the payload.
    pub fn field_value(&self) -> &Value {
        self.payload.get("value").unwrap_or(&self.payload)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind.trim().is_empty() {
            return Err(ProtocolError::MissingField("update.type"));
        }
        if matches!(self.field.as_deref(), Some(f) if f.trim().is_empty()) {
            return Err(ProtocolError::MissingField("update.field"));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, user: MemberProfile },

    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    TypingStatus {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
        is_typing: bool,
    },

    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
        x: f64,
        y: f64,
    },

    #[serde(rename_all = "camelCase")]
    ActiveView {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
        view: ActiveView,
    },

    #[serde(rename_all = "camelCase")]
    SplitUpdate { room_id: String, update: SplitUpdate },

    #[serde(rename_all = "camelCase")]
    AckUpdate { room_id: String, field: String },

    #[serde(rename_all = "camelCase")]
    ResolveConflict {
        room_id: String,
        field: String,
        resolution: Resolution,
    },

    #[serde(rename_all = "camelCase")]
    Activity {
        room_id: String,
        kind: ActivityKind,
        message: String,
    },

    Heartbeat,
}

impl ClientEvent {
    /// Wire name of the event, used in acknowledgments.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::TypingStatus { .. } => "typing-status",
            Self::CursorUpdate { .. } => "cursor-update",
            Self::ActiveView { .. } => "active-view",
            Self::SplitUpdate { .. } => "split-update",
            Self::AckUpdate { .. } => "ack-update",
            Self::ResolveConflict { .. } => "resolve-conflict",
            Self::Activity { .. } => "activity",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Room the event targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::LeaveRoom { room_id, .. }
            | Self::TypingStatus { room_id, .. }
            | Self::CursorUpdate { room_id, .. }
            | Self::ActiveView { room_id, .. }
            | Self::SplitUpdate { room_id, .. }
            | Self::AckUpdate { room_id, .. }
            | Self::ResolveConflict { room_id, .. }
            | Self::Activity { room_id, .. } => Some(room_id),
            Self::Heartbeat => None,
        }
    }

    /// Shape checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(room_id) = self.room_id() {
            if room_id.trim().is_empty() {
                return Err(ProtocolError::MissingField("roomId"));
            }
        }
        match self {
            Self::JoinRoom { user, .. } if user.user_id.trim().is_empty() => {
                Err(ProtocolError::MissingField("user.userId"))
            }
            Self::CursorUpdate { x, y, .. } if !x.is_finite() || !y.is_finite() => {
                Err(ProtocolError::InvalidValue {
                    field: "cursor",
                    reason: "coordinates must be finite".into(),
                })
            }
            Self::SplitUpdate { update, .. } => update.validate(),
            Self::AckUpdate { field, .. } | Self::ResolveConflict { field, .. }
                if field.trim().is_empty() =>
            {
                Err(ProtocolError::MissingField("field"))
            }
            _ => Ok(()),
        }
    }

    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Server-originated notifications published into a room by other
/// backend services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    PaymentStatus,
    SplitUpdated,
    ParticipantJoined,
    SplitCompleted,
}

/// Why the server took a connection out of its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// No frame arrived within the idle window.
    Idle,
    /// The same user joined the room from another connection.
    Replaced,
    /// A backend service removed the member.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Direct reply to a successful join.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        members: PresenceSnapshot,
        activities: Vec<ActivityEvent>,
        conflicts: Vec<ConflictInfo>,
    },

    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        room_id: String,
        members: PresenceSnapshot,
    },

    ActivityNew { event: ActivityEvent },

    #[serde(rename_all = "camelCase")]
    SplitUpdate { room_id: String, update: SplitUpdate },

    #[serde(rename_all = "camelCase")]
    ConflictRaised {
        room_id: String,
        conflict: ConflictInfo,
    },

    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        room_id: String,
        field: String,
        resolution: Resolution,
        resolved_by: String,
    },

    #[serde(rename_all = "camelCase")]
    Notification {
        room_id: String,
        kind: NotificationKind,
        data: Value,
    },

    /// Sent to one connection only; it is no longer in the room and must
    /// re-join to get its events again.
    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: String, reason: LeaveReason },

    Ack { event: String },

    Error { message: String },

    HeartbeatAck,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn ack(event: &ClientEvent) -> Self {
        Self::Ack { event: event.name().to_string() }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_room() {
        let text = r#"{"event":"join-room","data":{"roomId":"s1","user":{"userId":"u1","name":"Alice","activeView":"items"}}}"#;
        let event = ClientEvent::decode(text).unwrap();
        match event {
            ClientEvent::JoinRoom { room_id, user } => {
                assert_eq!(room_id, "s1");
                assert_eq!(user.user_id, "u1");
                assert_eq!(user.name.as_deref(), Some("Alice"));
                assert_eq!(user.active_view, Some(ActiveView::Items));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_typing_status() {
        let text = r#"{"event":"typing-status","data":{"roomId":"s1","userId":"u1","isTyping":true}}"#;
        let event = ClientEvent::decode(text).unwrap();
        assert_eq!(
            event,
            ClientEvent::TypingStatus {
                room_id: "s1".into(),
                user_id: Some("u1".into()),
                is_typing: true,
            }
        );
        assert_eq!(event.name(), "typing-status");
    }

    #[test]
    fn test_decode_heartbeat_without_data() {
        let event = ClientEvent::decode(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(event, ClientEvent::Heartbeat);
        assert!(event.room_id().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(ClientEvent::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            ClientEvent::decode(r#"{"event":"dance","data":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_empty_room() {
        let text = r#"{"event":"leave-room","data":{"roomId":"  "}}"#;
        assert_eq!(ClientEvent::decode(text), Err(ProtocolError::MissingField("roomId")));
    }

    #[test]
    fn test_decode_rejects_missing_user_id() {
        let text = r#"{"event":"join-room","data":{"roomId":"s1","user":{"userId":""}}}"#;
        assert_eq!(ClientEvent::decode(text), Err(ProtocolError::MissingField("user.userId")));
    }

    #[test]
    fn test_decode_rejects_update_without_type() {
        let text = r#"{"event":"split-update","data":{"roomId":"s1","update":{"type":"","payload":{}}}}"#;
        assert_eq!(ClientEvent::decode(text), Err(ProtocolError::MissingField("update.type")));
    }

    #[test]
    fn test_split_update_defaults() {
        let text = r#"{"event":"split-update","data":{"roomId":"s1","update":{"type":"item-updated"}}}"#;
        match ClientEvent::decode(text).unwrap() {
            ClientEvent::SplitUpdate { update, .. } => {
                assert_eq!(update.kind, "item-updated");
                assert_eq!(update.payload, Value::Null);
                assert!(update.field_key().is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_field_key_falls_back_to_payload() {
        let update = SplitUpdate::new("item-updated", json!({"field": "item.price", "value": 12.5}));
        assert_eq!(update.field_key(), Some("item.price"));
        assert_eq!(update.field_value(), &json!(12.5));

        let explicit = update.clone().with_field("item.name");
        assert_eq!(explicit.field_key(), Some("item.name"));
    }

    #[test]
    fn test_field_value_without_value_key() {
        let update = SplitUpdate::new("note", json!("hello")).with_field("note");
        assert_eq!(update.field_value(), &json!("hello"));
    }

    #[test]
    fn test_resolve_conflict_wire_shape() {
        let event = ClientEvent::ResolveConflict {
            room_id: "s1".into(),
            field: "item.price".into(),
            resolution: Resolution::Remote,
        };
        let json: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["event"], "resolve-conflict");
        assert_eq!(json["data"]["roomId"], "s1");
        assert_eq!(json["data"]["resolution"], "remote");
    }

    #[test]
    fn test_server_event_wire_names() {
        let presence = ServerEvent::PresenceUpdate {
            room_id: "s1".into(),
            members: PresenceSnapshot::new(),
        };
        let json: Value = serde_json::from_str(&presence.encode().unwrap()).unwrap();
        assert_eq!(json["event"], "presence-update");
        assert_eq!(json["data"]["roomId"], "s1");

        let ack = ServerEvent::ack(&ClientEvent::Heartbeat);
        assert_eq!(ack, ServerEvent::Ack { event: "heartbeat".into() });

        let left = ServerEvent::RoomLeft {
            room_id: "s1".into(),
            reason: LeaveReason::Idle,
        };
        let json: Value = serde_json::from_str(&left.encode().unwrap()).unwrap();
        assert_eq!(json["event"], "room-left");
        assert_eq!(json["data"]["reason"], "idle");

        let json: Value = serde_json::from_str(&ServerEvent::HeartbeatAck.encode().unwrap()).unwrap();
        assert_eq!(json["event"], "heartbeat-ack");
    }

    #[test]
    fn test_server_event_decode() {
        let text = ServerEvent::error("boom").encode().unwrap();
        assert_eq!(ServerEvent::decode(&text).unwrap(), ServerEvent::error("boom"));
    }
}
