//! Transport-agnostic collaboration service.
//!
//! `CollabHub` ties the registry, the per-room routers, the activity logs
//! and the conflict queues together. Every public operation locks exactly
//! one room, mutates it, and emits its broadcasts before releasing the
//! lock, so observers see events in the order the hub accepted them.
//!
//! The WebSocket server drives the hub through [`crate::session::Session`];
//! backend services can call it directly (e.g. [`CollabHub::publish_notification`]).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::activity::{ActivityEvent, ActivityKind};
use crate::broadcast::{RoomSubscription, RouterStats};
use crate::config::ServerConfig;
use crate::conflict::{ConflictInfo, Detection, Resolution};
use crate::error::{CollabError, Result};
use crate::presence::{
    ActiveView, Cursor, JoinKind, Member, MemberProfile, PresenceSet, PresenceSnapshot, SessionId,
};
use crate::protocol::{LeaveReason, NotificationKind, ProtocolError, ServerEvent, SplitUpdate};
use crate::registry::{Room, RoomState, SessionRegistry};

/// What a joining member gets back.
#[derive(Debug)]
pub struct JoinOutcome {
    pub kind: JoinKind,
    pub snapshot: PresenceSnapshot,
    /// History as it was before this join, newest first.
    pub activities: Vec<ActivityEvent>,
    pub conflicts: Vec<ConflictInfo>,
    /// Full awareness document when any cursor is shared, for catching up CRDT clients.
    pub awareness_state: Option<Vec<u8>>,
    pub subscription: RoomSubscription,
}

/// Fate of a split update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Relayed; `recipients` counts the room subscriptions it was queued for.
    Broadcast { recipients: usize },
    /// Held back; a conflict was raised instead.
    Conflict(ConflictInfo),
}

pub struct CollabHub {
    registry: SessionRegistry,
    max_members_per_room: usize,
}

impl CollabHub {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.broadcast_capacity, config.conflict_window()),
            max_members_per_room: config.max_members_per_room,
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Membership
    // ───────────────────────────────────────────────────────────────

    /// Add a member to a room, creating the room on first join.
    ///
    /// A second join of the same user replaces the first entry. The
    /// presence snapshot goes to every member, the joiner included.
    pub async fn join(&self, room_id: &str, profile: MemberProfile, session: SessionId) -> Result<JoinOutcome> {
        if room_id.trim().is_empty() {
            return Err(ProtocolError::MissingField("roomId").into());
        }
        if profile.user_id.trim().is_empty() {
            return Err(ProtocolError::MissingField("user.userId").into());
        }

        loop {
            let room = self.registry.get_or_create(room_id).await;
            let mut state = room.lock().await;
            if state.closed {
                // Lost the race against the last leave; the map has a fresh room by now.
                continue;
            }

            if !state.presence.contains(&profile.user_id) && state.presence.len() >= self.max_members_per_room {
                return Err(CollabError::RoomFull {
                    room_id: room_id.to_string(),
                    limit: self.max_members_per_room,
                });
            }

            let router = room.router();
            let subscription = router.subscribe(profile.user_id.clone(), session);
            let activities = state.activity.recent();
            let previous_owner = state.presence.session_of(&profile.user_id);
            let member = Member::from_profile(profile, session, Utc::now());
            let kind = state.presence.join(member.clone());

            if let Some(previous) = previous_owner.filter(|&s| s != session) {
                router.revoke(room_id, previous, LeaveReason::Replaced)?;
            }
            if kind == JoinKind::Replaced {
                if let Some(diff) = state.awareness.remove(&member.user_id) {
                    router.publish_binary(diff, None);
                }
            } else {
                router.broadcast_activity(&mut state.activity, ActivityEvent::joined(room_id, &member))?;
            }
            let snapshot = state.presence.snapshot();
            router.broadcast_presence(room_id, snapshot.clone(), None)?;

            log::info!(
                "{} ({}) joined room {room_id} [{} members]",
                member.name,
                member.user_id,
                state.presence.len()
            );

            return Ok(JoinOutcome {
                kind,
                snapshot,
                activities,
                conflicts: state.conflicts.pending(),
                awareness_state: state.awareness.has_entries().then(|| state.awareness.encode_state()),
                subscription,
            });
        }
    }

    /// Remove a member on behalf of the server. Unknown rooms and members
    /// are a no-op. The owning connection is told with `room-left`.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<bool> {
        self.remove_member(room_id, Some(LeaveReason::Removed), |presence| presence.leave(user_id))
            .await
    }

    /// Leave requested by a connection: remove the member only if `session`
    /// still owns it.
    pub async fn leave_session(&self, room_id: &str, user_id: &str, session: SessionId) -> Result<bool> {
        self.remove_member(room_id, None, |presence| presence.leave_session(user_id, session))
            .await
    }

    async fn remove_member(
        &self,
        room_id: &str,
        notify: Option<LeaveReason>,
        take: impl FnOnce(&mut PresenceSet) -> Option<Member>,
    ) -> Result<bool> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(false);
        };
        let mut state = room.lock().await;
        let Some(member) = take(&mut state.presence) else {
            return Ok(false);
        };
        if let Some(reason) = notify {
            room.router().revoke(room_id, member.session, reason)?;
        }
        self.finish_leave(&room, &mut state, member).await?;
        Ok(true)
    }

    /// Shared tail of leave, disconnect and eviction. Runs under the room lock.
    async fn finish_leave(&self, room: &Arc<Room>, state: &mut RoomState, member: Member) -> Result<()> {
        let router = room.router();
        if let Some(diff) = state.awareness.remove(&member.user_id) {
            router.publish_binary(diff, Some(&member.user_id));
        }
        router.broadcast_activity(&mut state.activity, ActivityEvent::left(room.id(), &member))?;

        log::info!("{} ({}) left room {}", member.name, member.user_id, room.id());

        if state.presence.is_empty() {
            state.closed = true;
            self.registry.remove(room).await;
        } else {
            router.broadcast_presence(room.id(), state.presence.snapshot(), Some(&member.user_id))?;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Presence
    // ───────────────────────────────────────────────────────────────

    /// Apply a presence mutation and tell everyone but the mutating member.
    ///
    /// Returns `false` (and sends nothing) when `session` does not own the
    /// member's entry in the room.
    async fn mutate_presence(
        &self,
        room_id: &str,
        user_id: &str,
        session: SessionId,
        f: impl FnOnce(&Room, &mut RoomState, DateTime<Utc>) -> bool,
    ) -> Result<bool> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(false);
        };
        let mut state = room.lock().await;
        if !state.presence.owned_by(user_id, session) || !f(&room, &mut state, Utc::now()) {
            return Ok(false);
        }
        room.router()
            .broadcast_presence(room_id, state.presence.snapshot(), Some(user_id))?;
        Ok(true)
    }

    pub async fn set_typing(&self, room_id: &str, user_id: &str, session: SessionId, is_typing: bool) -> Result<bool> {
        log::trace!("{user_id} typing={is_typing} in {room_id}");
        self.mutate_presence(room_id, user_id, session, |_, state, now| {
            state.presence.set_typing(user_id, is_typing, now)
        })
        .await
    }

    /// Move a member's cursor; the awareness document is kept in step.
    pub async fn set_cursor(&self, room_id: &str, user_id: &str, session: SessionId, cursor: Cursor) -> Result<bool> {
        if !cursor.is_finite() {
            return Err(ProtocolError::InvalidValue {
                field: "cursor",
                reason: "coordinates must be finite".into(),
            }
            .into());
        }
        self.mutate_presence(room_id, user_id, session, |room, state, now| {
            if !state.presence.set_cursor(user_id, cursor, now) {
                return false;
            }
            let diff = state.awareness.set_cursor(user_id, cursor);
            room.router().publish_binary(diff, Some(user_id));
            true
        })
        .await
    }

    pub async fn set_active_view(
        &self,
        room_id: &str,
        user_id: &str,
        session: SessionId,
        view: ActiveView,
    ) -> Result<bool> {
        self.mutate_presence(room_id, user_id, session, |_, state, now| {
            state.presence.set_active_view(user_id, view, now)
        })
        .await
    }

    /// Refresh `lastSeen` without broadcasting.
    ///
    /// Returns `false` when `session` no longer owns the member's entry.
    pub async fn touch(&self, room_id: &str, user_id: &str, session: SessionId) -> bool {
        let Some(room) = self.registry.get(room_id).await else {
            return false;
        };
        let mut state = room.lock().await;
        state.presence.owned_by(user_id, session) && state.presence.touch(user_id, Utc::now())
    }

    /// Whether connection `session` owns the entry of `user_id` in the room.
    pub async fn owns(&self, room_id: &str, user_id: &str, session: SessionId) -> bool {
        match self.registry.get(room_id).await {
            Some(room) => room.lock().await.presence.owned_by(user_id, session),
            None => false,
        }
    }

    /// Immutable copy of a room's members; empty for an unknown room.
    pub async fn snapshot(&self, room_id: &str) -> PresenceSnapshot {
        match self.registry.get(room_id).await {
            Some(room) => room.lock().await.presence.snapshot(),
            None => PresenceSnapshot::new(),
        }
    }

    /// Merge a client's awareness update and relay it to the rest of the room.
    pub async fn apply_awareness(
        &self,
        room_id: &str,
        user_id: &str,
        session: SessionId,
        update: &[u8],
    ) -> Result<usize> {
        let room = self
            .registry
            .get(room_id)
            .await
            .ok_or_else(|| CollabError::NotJoined(room_id.to_string()))?;
        let mut state = room.lock().await;
        if !state.presence.owned_by(user_id, session) {
            return Err(CollabError::NotJoined(room_id.to_string()));
        }

        state.awareness.apply_update(update).map_err(CollabError::Awareness)?;
        let router = room.router();
        let recipients = router.publish_binary(update.to_vec(), Some(user_id));

        // Only the sender's own entry feeds presence.
        let cursor = state.awareness.cursor(user_id);
        let changed = match (cursor, state.presence.get(user_id)) {
            (Some(cursor), Some(member)) => member.cursor != Some(cursor),
            _ => false,
        };
        if let (true, Some(cursor)) = (changed, cursor) {
            state.presence.set_cursor(user_id, cursor, Utc::now());
            router.broadcast_presence(room_id, state.presence.snapshot(), Some(user_id))?;
        } else {
            state.presence.touch(user_id, Utc::now());
        }
        Ok(recipients)
    }

    // ───────────────────────────────────────────────────────────────
    // Activity
    // ───────────────────────────────────────────────────────────────

    /// Append an event to the room log and send it to everyone.
    ///
    /// Returns `false` when the room does not exist.
    pub async fn broadcast_activity(&self, room_id: &str, event: ActivityEvent) -> Result<bool> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(false);
        };
        let mut state = room.lock().await;
        room.router().broadcast_activity(&mut state.activity, event)?;
        Ok(true)
    }

    /// Activity reported by a member; the name comes from its presence entry.
    pub async fn record_activity(
        &self,
        room_id: &str,
        user_id: &str,
        session: SessionId,
        kind: ActivityKind,
        message: &str,
    ) -> Result<ActivityEvent> {
        let room = self
            .registry
            .get(room_id)
            .await
            .ok_or_else(|| CollabError::NotJoined(room_id.to_string()))?;
        let mut state = room.lock().await;
        let Some(member) = state.presence.get(user_id).filter(|m| m.session == session) else {
            return Err(CollabError::NotJoined(room_id.to_string()));
        };
        let event = ActivityEvent::new(room_id, kind, user_id, member.name.as_str(), message);
        room.router().broadcast_activity(&mut state.activity, event.clone())?;
        Ok(event)
    }

    pub async fn activities(&self, room_id: &str) -> Vec<ActivityEvent> {
        match self.registry.get(room_id).await {
            Some(room) => room.lock().await.activity.recent(),
            None => Vec::new(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Updates & conflicts
    // ───────────────────────────────────────────────────────────────

    /// Relay a split update from `sender_id` to the rest of the room.
    ///
    /// The server stamps sender and time. A write to a field another member
    /// wrote within the conflict window (and nobody acknowledged) is held
    /// back and raised as a conflict instead.
    pub async fn send_update(
        &self,
        room_id: &str,
        sender_id: &str,
        session: SessionId,
        mut update: SplitUpdate,
    ) -> Result<UpdateOutcome> {
        update.validate()?;
        let room = self
            .registry
            .get(room_id)
            .await
            .ok_or_else(|| CollabError::NotJoined(room_id.to_string()))?;
        let mut state = room.lock().await;
        if !state.presence.owned_by(sender_id, session) {
            return Err(CollabError::NotJoined(room_id.to_string()));
        }

        let now = Utc::now();
        update.user_id = sender_id.to_string();
        update.timestamp = now;
        state.presence.touch(sender_id, now);

        if let Some(field) = update.field_key().map(str::to_string) {
            let value = update.field_value().clone();
            let detection = state.detector.observe(&field, sender_id, &value, now);
            if let Detection::Conflict { remote_user, remote_value } = detection {
                let conflict =
                    ConflictInfo::new(field.as_str(), value, remote_value, remote_user).with_local_user(sender_id);
                state.conflicts.raise(conflict.clone());
                room.router().publish(
                    &ServerEvent::ConflictRaised {
                        room_id: room_id.to_string(),
                        conflict: conflict.clone(),
                    },
                    None,
                )?;
                log::warn!(
                    "Conflict on {field} in room {room_id}: {sender_id} vs {}",
                    conflict.remote_user
                );
                return Ok(UpdateOutcome::Conflict(conflict));
            }
        }

        let recipients = room.router().broadcast_update(room_id, &update, sender_id)?;
        log::debug!("Update {} from {sender_id} in {room_id} → {recipients} peers", update.kind);
        Ok(UpdateOutcome::Broadcast { recipients })
    }

    /// Raise a conflict explicitly. No-op for an unknown room.
    pub async fn raise_conflict(&self, room_id: &str, conflict: ConflictInfo) -> Result<bool> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(false);
        };
        let mut state = room.lock().await;
        state.conflicts.raise(conflict.clone());
        room.router().publish(
            &ServerEvent::ConflictRaised {
                room_id: room_id.to_string(),
                conflict,
            },
            None,
        )?;
        Ok(true)
    }

    /// Mark the last write to `field` as seen, so a follow-up edit is accepted.
    pub async fn acknowledge_update(&self, room_id: &str, field: &str) -> bool {
        match self.registry.get(room_id).await {
            Some(room) => room.lock().await.detector.acknowledge(field),
            None => false,
        }
    }

    /// Remove the oldest pending conflict on `field` and notify the room.
    ///
    /// Returns `None` when nothing was pending. The chosen resolution is only
    /// reported; applying it is up to the clients.
    pub async fn resolve_conflict(
        &self,
        room_id: &str,
        field: &str,
        resolution: Resolution,
        resolved_by: &str,
    ) -> Result<Option<ConflictInfo>> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(None);
        };
        let mut state = room.lock().await;
        let Some(conflict) = state.conflicts.resolve(field) else {
            return Ok(None);
        };
        state.detector.clear(field);
        room.router().publish(
            &ServerEvent::ConflictResolved {
                room_id: room_id.to_string(),
                field: field.to_string(),
                resolution,
                resolved_by: resolved_by.to_string(),
            },
            None,
        )?;
        log::info!("Conflict on {field} in room {room_id} resolved by {resolved_by} ({resolution:?})");
        Ok(Some(conflict))
    }

    pub async fn conflicts(&self, room_id: &str) -> Vec<ConflictInfo> {
        match self.registry.get(room_id).await {
            Some(room) => room.lock().await.conflicts.pending(),
            None => Vec::new(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Server-side emission & housekeeping
    // ───────────────────────────────────────────────────────────────

    /// Push a backend notification to every member of a room.
    ///
    /// Returns the number of recipients; `0` for an unknown room.
    pub async fn publish_notification(&self, room_id: &str, kind: NotificationKind, data: Value) -> Result<usize> {
        let Some(room) = self.registry.get(room_id).await else {
            return Ok(0);
        };
        // Held so the notification is ordered with the room's other emissions.
        let _guard = room.lock().await;
        let event = ServerEvent::Notification {
            room_id: room_id.to_string(),
            kind,
            data,
        };
        Ok(room.router().publish(&event, None)?)
    }

    /// Evict members silent for longer than `idle`, with full leave cleanup.
    ///
    /// Returns `(room_id, user_id)` for every evicted member.
    pub async fn evict_idle(&self, idle: Duration) -> Result<Vec<(String, String)>> {
        let cutoff = Utc::now() - TimeDelta::from_std(idle).unwrap_or(TimeDelta::MAX);
        let mut evicted = Vec::new();

        for room in self.registry.rooms().await {
            let mut state = room.lock().await;
            if state.closed {
                continue;
            }
            for user_id in state.presence.idle_members(cutoff) {
                if let Some(member) = state.presence.leave(&user_id) {
                    log::info!("Evicting idle member {user_id} from room {}", room.id());
                    room.router().revoke(room.id(), member.session, LeaveReason::Idle)?;
                    self.finish_leave(&room, &mut state, member).await?;
                    evicted.push((room.id().to_string(), user_id));
                }
            }
        }
        Ok(evicted)
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.registry.room_ids().await
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<RouterStats> {
        self.registry.get(room_id).await.map(|room| room.router().stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Frame;
    use serde_json::json;

    fn hub() -> CollabHub {
        CollabHub::new(&ServerConfig::default())
    }

    fn profile(id: &str, name: &str) -> MemberProfile {
        MemberProfile::new(id, name)
    }

    /// Drain every text event currently queued for a subscriber.
    fn drain(sub: &mut RoomSubscription) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(envelope) = sub.try_recv() {
            if let Frame::Text(text) = &envelope.frame {
                events.push(ServerEvent::decode(text).unwrap());
            }
        }
        events
    }

    fn presence_events(events: &[ServerEvent]) -> Vec<&PresenceSnapshot> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::PresenceUpdate { members, .. } => Some(members),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_creates_room_and_notifies_everyone() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        assert_eq!(a.kind, JoinKind::New);
        assert!(a.activities.is_empty());

        let b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        assert_eq!(b.snapshot.len(), 2);
        assert_eq!(b.activities.len(), 1); // Alice's join

        let events = drain(&mut a.subscription);
        let snaps = presence_events(&events);
        assert_eq!(snaps.len(), 2);
        assert!(snaps[1].contains_key("a") && snaps[1].contains_key("b"));
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_rejects_blank_identity() {
        let hub = hub();
        assert!(hub.join("", profile("a", "Alice"), 1).await.is_err());
        assert!(hub.join("s1", MemberProfile::default(), 1).await.is_err());
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_full() {
        let config = ServerConfig {
            max_members_per_room: 1,
            ..ServerConfig::default()
        };
        let hub = CollabHub::new(&config);
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();

        let err = hub.join("s1", profile("b", "Bob"), 2).await.unwrap_err();
        assert!(matches!(err, CollabError::RoomFull { limit: 1, .. }));
        // Re-joining an existing member is not limited.
        assert!(hub.join("s1", profile("a", "Alice"), 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejoin_replaces_entry() {
        let hub = hub();
        let _a1 = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        hub.set_typing("s1", "a", 1, true).await.unwrap();
        let a2 = hub.join("s1", profile("a", "Alice"), 2).await.unwrap();

        assert_eq!(a2.kind, JoinKind::Replaced);
        assert_eq!(a2.snapshot.len(), 1);
        assert!(!a2.snapshot["a"].is_typing);
        // Only one join activity is logged.
        assert_eq!(hub.activities("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_deletes_empty_room() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        assert!(hub.leave("s1", "a").await.unwrap());
        assert_eq!(hub.room_count().await, 0);
        assert!(hub.snapshot("s1").await.is_empty());
        // Idempotent.
        assert!(!hub.leave("s1", "a").await.unwrap());
        assert!(!hub.leave("nowhere", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining_members() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);

        hub.leave("s1", "b").await.unwrap();
        let events = drain(&mut a.subscription);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ActivityNew { event } if event.kind == ActivityKind::Leave && event.user_id == "b"
        )));
        let snaps = presence_events(&events);
        assert_eq!(snaps.len(), 1);
        assert!(!snaps[0].contains_key("b"));
    }

    #[tokio::test]
    async fn test_leave_session_keeps_newer_connection() {
        let hub = hub();
        let _old = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _new = hub.join("s1", profile("a", "Alice"), 2).await.unwrap();

        assert!(!hub.leave_session("s1", "a", 1).await.unwrap());
        assert!(hub.snapshot("s1").await.contains_key("a"));
        assert!(hub.leave_session("s1", "a", 2).await.unwrap());
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_typing_is_not_echoed() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);
        drain(&mut b.subscription);

        assert!(hub.set_typing("s1", "a", 1, true).await.unwrap());

        assert!(drain(&mut a.subscription).is_empty());
        let events = drain(&mut b.subscription);
        let snaps = presence_events(&events);
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0]["a"].is_typing);
    }

    #[tokio::test]
    async fn test_presence_mutation_for_absent_member_is_silent() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        drain(&mut a.subscription);

        assert!(!hub.set_typing("s1", "ghost", 9, true).await.unwrap());
        assert!(!hub.set_active_view("s1", "ghost", 9, ActiveView::Payment).await.unwrap());
        assert!(!hub.set_cursor("nowhere", "a", 1, Cursor::new(1.0, 1.0)).await.unwrap());
        assert!(drain(&mut a.subscription).is_empty());
    }

    #[tokio::test]
    async fn test_cursor_updates_presence_and_awareness() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut b.subscription);

        assert!(hub.set_cursor("s1", "a", 1, Cursor::new(4.0, 2.0)).await.unwrap());
        assert_eq!(hub.snapshot("s1").await["a"].cursor, Some(Cursor::new(4.0, 2.0)));

        let mut binary = 0;
        while let Some(envelope) = b.subscription.try_recv() {
            if matches!(envelope.frame, Frame::Binary(_)) {
                binary += 1;
            }
        }
        assert_eq!(binary, 1);
        assert!(hub.set_cursor("s1", "a", 1, Cursor::new(f64::NAN, 0.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_awareness_merges_sender_cursor() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();

        let client = crate::awareness::RoomAwareness::new();
        let update = client.set_cursor("a", Cursor::new(7.0, 8.0));
        hub.apply_awareness("s1", "a", 1, &update).await.unwrap();

        assert_eq!(hub.snapshot("s1").await["a"].cursor, Some(Cursor::new(7.0, 8.0)));
        assert!(matches!(
            hub.apply_awareness("s1", "ghost", 9, &update).await,
            Err(CollabError::NotJoined(_))
        ));
        assert!(matches!(
            hub.apply_awareness("s1", "a", 1, &[0xff]).await,
            Err(CollabError::Awareness(_))
        ));
    }

    #[tokio::test]
    async fn test_update_skips_sender_and_is_stamped() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);
        drain(&mut b.subscription);

        let mut update = SplitUpdate::new("item-added", json!({"name": "Pizza"}));
        update.user_id = "spoofed".into();
        let outcome = hub.send_update("s1", "a", 1, update).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Broadcast { recipients: 2 });

        assert!(drain(&mut a.subscription).is_empty());
        match drain(&mut b.subscription).as_slice() {
            [ServerEvent::SplitUpdate { update, .. }] => assert_eq!(update.user_id, "a"),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_from_non_member_rejected() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let update = SplitUpdate::new("item-added", json!({}));
        assert!(matches!(
            hub.send_update("s1", "ghost", 9, update.clone()).await,
            Err(CollabError::NotJoined(_))
        ));
        assert!(matches!(
            hub.send_update("s1", "a", 1, SplitUpdate::new("", json!({}))).await,
            Err(CollabError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_field_writes_raise_conflict() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);
        drain(&mut b.subscription);

        let first = SplitUpdate::new("item-updated", json!({"value": 10})).with_field("item.price");
        let second = SplitUpdate::new("item-updated", json!({"value": 12})).with_field("item.price");

        assert!(matches!(
            hub.send_update("s1", "a", 1, first).await.unwrap(),
            UpdateOutcome::Broadcast { .. }
        ));
        let UpdateOutcome::Conflict(conflict) = hub.send_update("s1", "b", 2, second).await.unwrap() else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.field, "item.price");
        assert_eq!(conflict.local_value, json!(12));
        assert_eq!(conflict.remote_value, json!(10));
        assert_eq!(conflict.remote_user, "a");
        assert_eq!(conflict.local_user, "b");

        // Bob's write was not relayed to Alice; both saw the conflict.
        let for_a = drain(&mut a.subscription);
        assert!(!for_a.iter().any(|e| matches!(e, ServerEvent::SplitUpdate { .. })));
        assert!(for_a.iter().any(|e| matches!(e, ServerEvent::ConflictRaised { .. })));
        assert_eq!(hub.conflicts("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_update_does_not_conflict() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();

        let first = SplitUpdate::new("item-updated", json!({"field": "item.price", "value": 10}));
        hub.send_update("s1", "a", 1, first).await.unwrap();
        assert!(hub.acknowledge_update("s1", "item.price").await);

        let second = SplitUpdate::new("item-updated", json!({"field": "item.price", "value": 12}));
        assert!(matches!(
            hub.send_update("s1", "b", 2, second).await.unwrap(),
            UpdateOutcome::Broadcast { .. }
        ));
        assert!(hub.conflicts("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_conflict() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        hub.raise_conflict("s1", ConflictInfo::new("item.price", json!(1), json!(2), "b"))
            .await
            .unwrap();
        hub.raise_conflict("s1", ConflictInfo::new("item.price", json!(3), json!(4), "b"))
            .await
            .unwrap();
        drain(&mut a.subscription);

        let resolved = hub
            .resolve_conflict("s1", "item.price", Resolution::Remote, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.local_value, json!(1));
        assert_eq!(hub.conflicts("s1").await.len(), 1);

        match drain(&mut a.subscription).as_slice() {
            [ServerEvent::ConflictResolved { field, resolution, resolved_by, .. }] => {
                assert_eq!(field, "item.price");
                assert_eq!(*resolution, Resolution::Remote);
                assert_eq!(resolved_by, "a");
            }
            other => panic!("unexpected events {other:?}"),
        }

        assert!(hub.resolve_conflict("s1", "missing", Resolution::Local, "a").await.unwrap().is_none());
        assert!(hub.resolve_conflict("nowhere", "x", Resolution::Merge, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_activity_uses_member_name() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let event = hub
            .record_activity("s1", "a", 1, ActivityKind::ItemAdded, "added Pizza")
            .await
            .unwrap();
        assert_eq!(event.user_name, "Alice");
        assert_eq!(hub.activities("s1").await[0], event);
        assert!(hub.record_activity("s1", "ghost", 9, ActivityKind::Custom, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_notification() {
        let hub = hub();
        assert_eq!(
            hub.publish_notification("nowhere", NotificationKind::PaymentStatus, json!({}))
                .await
                .unwrap(),
            0
        );
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        drain(&mut a.subscription);

        let n = hub
            .publish_notification("s1", NotificationKind::PaymentStatus, json!({"status": "paid"}))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(matches!(
            drain(&mut a.subscription).as_slice(),
            [ServerEvent::Notification { kind: NotificationKind::PaymentStatus, .. }]
        ));
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.touch("s1", "a", 1).await;
        drain(&mut a.subscription);

        let evicted = hub.evict_idle(Duration::from_millis(20)).await.unwrap();
        assert_eq!(evicted, vec![("s1".to_string(), "b".to_string())]);
        let snaps_events = drain(&mut a.subscription);
        let snaps = presence_events(&snaps_events);
        assert_eq!(snaps.len(), 1);
        assert!(!snaps[0].contains_key("b"));
    }

    #[tokio::test]
    async fn test_eviction_revokes_owner_subscription() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);
        drain(&mut b.subscription);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(hub.touch("s1", "b", 2).await);
        hub.evict_idle(Duration::from_millis(20)).await.unwrap();

        let first = a.subscription.try_recv().unwrap();
        assert_eq!(first.revokes, Some(1));
        match drain(&mut b.subscription).first() {
            Some(ServerEvent::ActivityNew { event }) => assert_eq!(event.kind, ActivityKind::Leave),
            other => panic!("unexpected {other:?}"),
        }
        // Bob never sees Alice's revocation.
        assert!(!drain(&mut b.subscription)
            .iter()
            .any(|e| matches!(e, ServerEvent::RoomLeft { .. })));
    }

    #[tokio::test]
    async fn test_replaced_connection_loses_ownership() {
        let hub = hub();
        let mut old = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let mut new = hub.join("s1", profile("a", "Alice"), 2).await.unwrap();
        drain(&mut new.subscription);

        assert!(drain(&mut old.subscription).contains(&ServerEvent::RoomLeft {
            room_id: "s1".into(),
            reason: LeaveReason::Replaced,
        }));

        assert!(!hub.set_typing("s1", "a", 1, true).await.unwrap());
        assert!(!hub.snapshot("s1").await["a"].is_typing);
        assert!(!hub.touch("s1", "a", 1).await);
        assert!(!hub.owns("s1", "a", 1).await);
        assert!(matches!(
            hub.send_update("s1", "a", 1, SplitUpdate::new("item-added", json!({}))).await,
            Err(CollabError::NotJoined(_))
        ));
        assert!(hub.record_activity("s1", "a", 1, ActivityKind::Custom, "x").await.is_err());

        assert!(hub.set_typing("s1", "a", 2, true).await.unwrap());
        assert!(hub.owns("s1", "a", 2).await);
        assert!(drain(&mut new.subscription).is_empty());
    }

    #[tokio::test]
    async fn test_same_connection_rejoin_is_not_revoked() {
        let hub = hub();
        let mut first = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _second = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        assert!(!drain(&mut first.subscription)
            .iter()
            .any(|e| matches!(e, ServerEvent::RoomLeft { .. })));
    }

    #[tokio::test]
    async fn test_server_side_leave_tells_owner() {
        let hub = hub();
        let mut a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        let _b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        drain(&mut a.subscription);

        hub.leave("s1", "a").await.unwrap();
        assert_eq!(
            drain(&mut a.subscription).first(),
            Some(&ServerEvent::RoomLeft {
                room_id: "s1".into(),
                reason: LeaveReason::Removed,
            })
        );
    }

    #[tokio::test]
    async fn test_evict_last_member_closes_room() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.evict_idle(Duration::from_millis(1)).await.unwrap();
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_after_room_closed_gets_fresh_room() {
        let hub = hub();
        let _a = hub.join("s1", profile("a", "Alice"), 1).await.unwrap();
        hub.raise_conflict("s1", ConflictInfo::new("f", json!(1), json!(2), "x"))
            .await
            .unwrap();
        hub.leave("s1", "a").await.unwrap();

        let b = hub.join("s1", profile("b", "Bob"), 2).await.unwrap();
        assert!(b.conflicts.is_empty());
        assert!(b.activities.is_empty());
        assert_eq!(b.snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_across_rooms() {
        let hub = Arc::new(hub());
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                let room = format!("s{}", i % 4);
                let outcome = hub.join(&room, profile(&format!("u{i}"), "User"), i).await.unwrap();
                drop(outcome);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(hub.room_count().await, 4);
        let total: usize = {
            let mut total = 0;
            for id in hub.room_ids().await {
                total += hub.snapshot(&id).await.len();
            }
            total
        };
        assert_eq!(total, 20);
    }
}
