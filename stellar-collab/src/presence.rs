//! Presence model for a split room: who is connected and what they are doing.
//!
//! ## Architecture
//!
//! ```text
//! join-room / typing-status / cursor-update / active-view
//!       │
//!       ▼
//! PresenceSet::join() / set_typing() / set_cursor() / set_active_view()
//!       │  (mutations report whether anything changed)
//!       ▼
//! PresenceSet::snapshot()  ──►  presence-update fan-out
//! ```
//!
//! A `PresenceSet` belongs to exactly one room and is only ever touched
//! while that room's state lock is held.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a single transport connection.
pub type SessionId = u64;

/// Immutable copy of a room's members, keyed by user id.
pub type PresenceSnapshot = BTreeMap<String, Member>;

/// Display name used when a client joins without one.
pub const ANONYMOUS_NAME: &str = "Anonymous";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Which part of the split a member is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActiveView {
    #[default]
    SplitDetails,
    Items,
    Payment,
}

/// Pointer position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both coordinates are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// The profile a client supplies when joining a room.
///
/// Everything except the user id is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_view: Option<ActiveView>,
}

impl MemberProfile {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: Some(name.into()),
            avatar: None,
            active_view: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_view(mut self, view: ActiveView) -> Self {
        self.active_view = Some(view);
        self
    }
}

/// Live presence of a connected member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_typing: bool,
    pub last_seen: DateTime<Utc>,
    pub active_view: ActiveView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Connection that owns this entry; never sent over the wire.
    #[serde(skip)]
    pub(crate) session: SessionId,
}

impl Member {
    /// Build a fresh member from a join profile.
    pub fn from_profile(profile: MemberProfile, session: SessionId, now: DateTime<Utc>) -> Self {
        let name = profile
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_string());
        Self {
            user_id: profile.user_id,
            name,
            avatar: profile.avatar,
            is_typing: false,
            last_seen: now,
            active_view: profile.active_view.unwrap_or_default(),
            cursor: None,
            session,
        }
    }

    /// Whether `last_seen` is strictly older than `cutoff`.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen < cutoff
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence set: the member map of one room
// ───────────────────────────────────────────────────────────────────

/// Outcome of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// The user was not in the room before.
    New,
    /// The user re-joined; the previous entry was replaced.
    Replaced,
}

/// Member map of a single room.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    members: HashMap<String, Member>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, replacing any previous entry for the same user id.
    ///
    /// Last join wins: every presence field of the old entry is discarded.
    pub fn join(&mut self, member: Member) -> JoinKind {
        match self.members.insert(member.user_id.clone(), member) {
            Some(_) => JoinKind::Replaced,
            None => JoinKind::New,
        }
    }

    /// Remove a member. Returns the removed entry, `None` if absent.
    pub fn leave(&mut self, user_id: &str) -> Option<Member> {
        self.members.remove(user_id)
    }

    /// Remove a member only if the entry is still owned by `session`.
    ///
    /// A later join from another connection takes ownership of the entry,
    /// so the cleanup of the older connection must not evict it.
    pub fn leave_session(&mut self, user_id: &str, session: SessionId) -> Option<Member> {
        match self.members.get(user_id) {
            Some(m) if m.session == session => self.members.remove(user_id),
            _ => None,
        }
    }

    /// Whether the entry of `user_id` belongs to connection `session`.
    pub fn owned_by(&self, user_id: &str, session: SessionId) -> bool {
        self.members.get(user_id).is_some_and(|m| m.session == session)
    }

    /// Session owning the entry of `user_id`.
    pub fn session_of(&self, user_id: &str) -> Option<SessionId> {
        self.members.get(user_id).map(|m| m.session)
    }

    /// Set the typing flag. Returns `true` if the member exists.
    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, now: DateTime<Utc>) -> bool {
        self.update(user_id, now, |m| m.is_typing = is_typing)
    }

    /// Set the cursor position. Returns `true` if the member exists.
    pub fn set_cursor(&mut self, user_id: &str, cursor: Cursor, now: DateTime<Utc>) -> bool {
        self.update(user_id, now, |m| m.cursor = Some(cursor))
    }

    /// Set the active view. Returns `true` if the member exists.
    pub fn set_active_view(&mut self, user_id: &str, view: ActiveView, now: DateTime<Utc>) -> bool {
        self.update(user_id, now, |m| m.active_view = view)
    }

    /// Refresh `last_seen` only.
    pub fn touch(&mut self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.update(user_id, now, |_| {})
    }

    fn update(&mut self, user_id: &str, now: DateTime<Utc>, f: impl FnOnce(&mut Member)) -> bool {
        match self.members.get_mut(user_id) {
            Some(member) => {
                f(member);
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// User ids whose `last_seen` is older than `cutoff`.
    pub fn idle_members(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut idle: Vec<String> = self
            .members
            .values()
            .filter(|m| m.is_idle_since(cutoff))
            .map(|m| m.user_id.clone())
            .collect();
        idle.sort();
        idle
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.members
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect()
    }

    pub fn get(&self, user_id: &str) -> Option<&Member> {
        self.members.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
