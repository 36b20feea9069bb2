//! Per-room activity feed.
//!
//! Events are kept newest-first and capped at [`ACTIVITY_LOG_CAPACITY`];
//! once full, each append evicts the oldest entry. Entries are never
//! mutated after creation.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::Member;

/// Maximum number of events retained per room.
pub const ACTIVITY_LOG_CAPACITY: usize = 50;

/// Kind of activity shown in the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    Join,
    Leave,
    ItemAdded,
    ItemUpdated,
    ItemDeleted,
    PaymentStatus,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
}

impl ActivityEvent {
    pub fn new(
        room_id: impl Into<String>,
        kind: ActivityKind,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: user_id.into(),
            user_name: user_name.into(),
            message: message.into(),
            timestamp: Utc::now(),
            room_id: room_id.into(),
        }
    }

    pub fn joined(room_id: &str, member: &Member) -> Self {
        Self::new(
            room_id,
            ActivityKind::Join,
            member.user_id.as_str(),
            member.name.as_str(),
            format!("{} joined the split", member.name),
        )
    }

    pub fn left(room_id: &str, member: &Member) -> Self {
        Self::new(
            room_id,
            ActivityKind::Leave,
            member.user_id.as_str(),
            member.name.as_str(),
            format!("{} left the split", member.name),
        )
    }
}

/// Bounded, newest-first history of a room.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEvent>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(ACTIVITY_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend an event, evicting the oldest when over capacity.
    pub fn push(&mut self, event: ActivityEvent) {
        self.entries.push_front(event);
        self.entries.truncate(self.capacity);
    }

    /// Copy of the log, newest first.
    pub fn recent(&self) -> Vec<ActivityEvent> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&ActivityEvent> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemberProfile;

    fn custom(n: usize) -> ActivityEvent {
        ActivityEvent::new("s1", ActivityKind::Custom, "u1", "Alice", format!("event {n}"))
    }

    #[test]
    fn test_log_is_newest_first() {
        let mut log = ActivityLog::new();
        log.push(custom(1));
        log.push(custom(2));

        let recent = log.recent();
        assert_eq!(recent[0].message, "event 2");
        assert_eq!(recent[1].message, "event 1");
        assert_eq!(log.latest().unwrap().message, "event 2");
    }

    #[test]
    fn test_log_caps_at_fifty() {
        let mut log = ActivityLog::new();
        for n in 1..=51 {
            log.push(custom(n));
        }

        assert_eq!(log.len(), ACTIVITY_LOG_CAPACITY);
        let recent = log.recent();
        assert_eq!(recent.first().unwrap().message, "event 51");
        assert_eq!(recent.last().unwrap().message, "event 2");
        assert!(recent.iter().all(|e| e.message != "event 1"));
    }

    #[test]
    fn test_log_never_exceeds_capacity() {
        let mut log = ActivityLog::with_capacity(3);
        for n in 0..100 {
            log.push(custom(n));
            assert!(log.len() <= 3);
        }
        assert_eq!(log.capacity(), 3);
    }

    #[test]
    fn test_join_leave_messages() {
        let member = Member::from_profile(MemberProfile::new("u1", "Alice"), 1, Utc::now());
        let joined = ActivityEvent::joined("s1", &member);
        let left = ActivityEvent::left("s1", &member);

        assert_eq!(joined.kind, ActivityKind::Join);
        assert_eq!(joined.message, "Alice joined the split");
        assert_eq!(left.kind, ActivityKind::Leave);
        assert_eq!(left.room_id, "s1");
        assert_ne!(joined.id, left.id);
    }

    #[test]
    fn test_activity_json_shape() {
        let event = ActivityEvent::new("s1", ActivityKind::ItemAdded, "u1", "Alice", "added Pizza");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item-added");
        assert_eq!(json["userName"], "Alice");
        assert_eq!(json["roomId"], "s1");
    }
}
