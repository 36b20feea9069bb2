//! Field-level conflicts between near-simultaneous split updates.
//!
//! ```text
//! split-update(field) ──► ConflictDetector::observe()
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!        Detection::Accepted            Detection::Conflict
//!        (relay to room)                (ConflictQueue::raise)
//!                                              │
//!                          resolve-conflict ──►│ ConflictQueue::resolve()
//! ```
//!
//! A conflict is `raised → resolved`; there is no expiry. The queue does
//! not deduplicate and `resolve` removes only the oldest matching entry.
//! What "merge" means is left to the client that picks it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a member settled a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
    Merge,
}

/// A pending conflict on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub field: String,
    pub local_value: Value,
    pub remote_value: Value,
    /// Author of the update that was accepted first.
    pub remote_user: String,
    /// Author of the update that collided with it.
    #[serde(default)]
    pub local_user: String,
    pub timestamp: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn new(
        field: impl Into<String>,
        local_value: Value,
        remote_value: Value,
        remote_user: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            local_value,
            remote_value,
            remote_user: remote_user.into(),
            local_user: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_local_user(mut self, local_user: impl Into<String>) -> Self {
        self.local_user = local_user.into();
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Queue
// ───────────────────────────────────────────────────────────────────

/// Unresolved conflicts of one room, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ConflictQueue {
    entries: VecDeque<ConflictInfo>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, conflict: ConflictInfo) {
        self.entries.push_back(conflict);
    }

    /// Remove the oldest conflict on `field`.
    ///
    /// Returns `None` if nothing is pending for it.
    pub fn resolve(&mut self, field: &str) -> Option<ConflictInfo> {
        let idx = self.entries.iter().position(|c| c.field == field)?;
        self.entries.remove(idx)
    }

    pub fn pending(&self) -> Vec<ConflictInfo> {
        self.entries.iter().cloned().collect()
    }

    pub fn pending_for(&self, field: &str) -> usize {
        self.entries.iter().filter(|c| c.field == field).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Detector
// ───────────────────────────────────────────────────────────────────

/// Verdict for an incoming field update.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// No competing write; relay the update.
    Accepted,
    /// Another member wrote this field inside the window.
    Conflict {
        remote_user: String,
        remote_value: Value,
    },
}

#[derive(Debug, Clone)]
struct FieldWrite {
    sender: String,
    value: Value,
    at: DateTime<Utc>,
    acknowledged: bool,
}

/// Tracks the last accepted write per field and flags collisions.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: TimeDelta,
    writes: HashMap<String, FieldWrite>,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            writes: HashMap::new(),
        }
    }

    /// Classify a write of `value` to `field` by `sender` at `at`.
    ///
    /// A conflicting write is not recorded; the earlier write stays the
    /// reference until it is acknowledged, resolved, or ages out. Writes
    /// older than the window can no longer conflict and are dropped here.
    pub fn observe(&mut self, field: &str, sender: &str, value: &Value, at: DateTime<Utc>) -> Detection {
        let window = self.window;
        self.writes.retain(|_, write| at - write.at <= window);

        if let Some(prev) = self.writes.get(field) {
            if prev.sender != sender && !prev.acknowledged && at - prev.at <= self.window {
                return Detection::Conflict {
                    remote_user: prev.sender.clone(),
                    remote_value: prev.value.clone(),
                };
            }
        }

        self.writes.insert(
            field.to_string(),
            FieldWrite {
                sender: sender.to_string(),
                value: value.clone(),
                at,
                acknowledged: false,
            },
        );
        Detection::Accepted
    }

    /// Mark the last write to `field` as seen by the room.
    pub fn acknowledge(&mut self, field: &str) -> bool {
        match self.writes.get_mut(field) {
            Some(write) => {
                write.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Forget the last write to `field`.
    pub fn clear(&mut self, field: &str) {
        self.writes.remove(field);
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Fields with a write still inside the window.
    pub fn tracked_fields(&self) -> usize {
        self.writes.len()
    }
}
