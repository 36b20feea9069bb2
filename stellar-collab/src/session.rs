//! Per-connection state machine.
//!
//! A `Session` sits between one transport connection and the hub:
//!
//! ```text
//! text frame ──► ClientEvent::decode ──► Session::dispatch ──► CollabHub
//!                                              │
//!                         direct replies ◄─────┘  (room-joined, ack, error)
//! room broadcast ──► Session::next_frame ──► socket
//! ```
//!
//! A connection is in at most one room at a time. Joining another room
//! leaves the previous one; closing the session runs the same cleanup as
//! `leave-room`. Every inbound frame counts as liveness for the member.
//!
//! The hub owns the truth about membership: when it evicts the member, or
//! another connection takes the entry over, a `room-left` frame arrives on
//! the subscription and the session forgets the room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcast::{Frame, RoomSubscription};
use crate::error::{CollabError, Result};
use crate::hub::CollabHub;
use crate::presence::{Cursor, SessionId};
use crate::protocol::{ClientEvent, ServerEvent};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Something to write back on this connection only.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Event(ServerEvent),
    Awareness(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Membership {
    room_id: String,
    user_id: String,
}

pub struct Session {
    id: SessionId,
    hub: Arc<CollabHub>,
    /// User id proven by the handshake token, if auth is on.
    identity: Option<String>,
    membership: Option<Membership>,
    subscription: Option<RoomSubscription>,
}

impl Session {
    pub fn new(hub: Arc<CollabHub>, identity: Option<String>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            hub,
            identity,
            membership: None,
            subscription: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Room this connection is currently in.
    pub fn room_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room_id.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.user_id.as_str())
    }

    /// Handle one text frame. Failures become an `error` reply to this
    /// connection only.
    pub async fn handle_text(&mut self, text: &str) -> Vec<Outgoing> {
        self.touch().await;
        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Session {}: rejected frame: {e}", self.id);
                return vec![Outgoing::Event(ServerEvent::error(e.to_string()))];
            }
        };
        log::debug!("Session {}: {}", self.id, event.name());

        match self.dispatch(event).await {
            Ok(replies) => replies,
            Err(e) => {
                log::debug!("Session {}: {e}", self.id);
                vec![Outgoing::Event(ServerEvent::error(e.to_string()))]
            }
        }
    }

    /// Handle one binary frame: an awareness update for the current room.
    pub async fn handle_binary(&mut self, bytes: &[u8]) -> Vec<Outgoing> {
        self.touch().await;
        let result = match &self.membership {
            Some(m) => self.hub.apply_awareness(&m.room_id, &m.user_id, self.id, bytes).await,
            None => Err(CollabError::NoRoom),
        };
        match result {
            Ok(_) => Vec::new(),
            Err(e) => {
                log::debug!("Session {}: awareness rejected: {e}", self.id);
                vec![Outgoing::Event(ServerEvent::error(e.to_string()))]
            }
        }
    }

    pub async fn dispatch(&mut self, event: ClientEvent) -> Result<Vec<Outgoing>> {
        let ack = Outgoing::Event(ServerEvent::ack(&event));

        match event {
            ClientEvent::JoinRoom { room_id, user } => {
                if let Some(identity) = &self.identity {
                    if *identity != user.user_id {
                        return Err(CollabError::IdentityMismatch {
                            claimed: user.user_id,
                            actual: identity.clone(),
                        });
                    }
                }

                let next = Membership {
                    room_id: room_id.clone(),
                    user_id: user.user_id.clone(),
                };
                if let Some(previous) = self.membership.take() {
                    self.subscription = None;
                    if previous != next {
                        self.hub
                            .leave_session(&previous.room_id, &previous.user_id, self.id)
                            .await?;
                    }
                }

                let outcome = self.hub.join(&room_id, user, self.id).await?;
                self.membership = Some(next);
                self.subscription = Some(outcome.subscription);

                let mut replies = vec![Outgoing::Event(ServerEvent::RoomJoined {
                    room_id,
                    members: outcome.snapshot,
                    activities: outcome.activities,
                    conflicts: outcome.conflicts,
                })];
                if let Some(state) = outcome.awareness_state {
                    replies.push(Outgoing::Awareness(state));
                }
                Ok(replies)
            }

            ClientEvent::LeaveRoom { room_id, user_id } => {
                if self.room_id() == Some(room_id.as_str()) {
                    let user = self.acting_user(&room_id, user_id.as_deref())?;
                    self.membership = None;
                    self.subscription = None;
                    self.hub.leave_session(&room_id, &user, self.id).await?;
                }
                Ok(vec![ack])
            }

            ClientEvent::TypingStatus { room_id, user_id, is_typing } => {
                if let Some(user) = self.presence_user(&room_id, user_id.as_deref())? {
                    self.hub.set_typing(&room_id, &user, self.id, is_typing).await?;
                }
                Ok(Vec::new())
            }

            ClientEvent::CursorUpdate { room_id, user_id, x, y } => {
                if let Some(user) = self.presence_user(&room_id, user_id.as_deref())? {
                    self.hub.set_cursor(&room_id, &user, self.id, Cursor::new(x, y)).await?;
                }
                Ok(Vec::new())
            }

            ClientEvent::ActiveView { room_id, user_id, view } => {
                if let Some(user) = self.presence_user(&room_id, user_id.as_deref())? {
                    self.hub.set_active_view(&room_id, &user, self.id, view).await?;
                }
                Ok(Vec::new())
            }

            ClientEvent::SplitUpdate { room_id, update } => {
                let claimed = Some(update.user_id.as_str()).filter(|u| !u.is_empty());
                let user = self.acting_user(&room_id, claimed)?;
                self.hub.send_update(&room_id, &user, self.id, update).await?;
                Ok(vec![ack])
            }

            ClientEvent::AckUpdate { room_id, field } => {
                self.owning_user(&room_id).await?;
                self.hub.acknowledge_update(&room_id, &field).await;
                Ok(vec![ack])
            }

            ClientEvent::ResolveConflict { room_id, field, resolution } => {
                let user = self.owning_user(&room_id).await?;
                self.hub
                    .resolve_conflict(&room_id, &field, resolution, &user)
                    .await?;
                Ok(vec![ack])
            }

            ClientEvent::Activity { room_id, kind, message } => {
                let user = self.acting_user(&room_id, None)?;
                self.hub.record_activity(&room_id, &user, self.id, kind, &message).await?;
                Ok(vec![ack])
            }

            // Liveness was already refreshed by the frame itself.
            ClientEvent::Heartbeat => Ok(vec![Outgoing::Event(ServerEvent::HeartbeatAck)]),
        }
    }

    /// User this connection acts as in `room_id`; it must have joined it.
    fn acting_user(&self, room_id: &str, claimed: Option<&str>) -> Result<String> {
        let membership = self
            .membership
            .as_ref()
            .filter(|m| m.room_id == room_id)
            .ok_or_else(|| CollabError::NotJoined(room_id.to_string()))?;
        match claimed {
            Some(claimed) if claimed != membership.user_id => Err(CollabError::IdentityMismatch {
                claimed: claimed.to_string(),
                actual: membership.user_id.clone(),
            }),
            _ => Ok(membership.user_id.clone()),
        }
    }

    /// [`acting_user`](Self::acting_user), additionally checked against the
    /// hub: the entry must still belong to this connection.
    async fn owning_user(&self, room_id: &str) -> Result<String> {
        let user = self.acting_user(room_id, None)?;
        if !self.hub.owns(room_id, &user, self.id).await {
            return Err(CollabError::NotJoined(room_id.to_string()));
        }
        Ok(user)
    }

    /// Like [`acting_user`](Self::acting_user), but a room this connection
    /// is not in yields `None` so presence mutations stay silent no-ops.
    fn presence_user(&self, room_id: &str, claimed: Option<&str>) -> Result<Option<String>> {
        if self.room_id() != Some(room_id) {
            return Ok(None);
        }
        self.acting_user(room_id, claimed).map(Some)
    }

    /// Next broadcast frame for this connection.
    ///
    /// Pending forever while the connection is in no room. Cancel-safe.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            match self.subscription.as_mut() {
                Some(sub) => match sub.recv().await {
                    Some(envelope) => {
                        if envelope.revokes == Some(self.id) {
                            log::debug!("Session {}: membership revoked", self.id);
                            self.membership = None;
                            self.subscription = None;
                        }
                        return envelope.frame.clone();
                    }
                    None => self.subscription = None,
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Refresh the member's `lastSeen`; any frame from the peer counts.
    pub async fn touch(&self) {
        if let Some(m) = &self.membership {
            self.hub.touch(&m.room_id, &m.user_id, self.id).await;
        }
    }

    /// Disconnect cleanup.
    pub async fn close(&mut self) {
        self.subscription = None;
        if let Some(m) = self.membership.take() {
            if let Err(e) = self.hub.leave_session(&m.room_id, &m.user_id, self.id).await {
                log::error!("Session {}: cleanup of {} failed: {e}", self.id, m.room_id);
            }
        }
    }
}
