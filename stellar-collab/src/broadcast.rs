//! Per-room fan-out.
//!
//! Every room owns one tokio broadcast channel. A frame is encoded once and
//! shared by all subscribers behind an `Arc`; each subscriber drops frames
//! tagged as excluded for its own user, so "everyone but the sender" costs
//! nothing extra on the send path.
//!
//! Delivery is at-most-once. A subscriber that falls more than `capacity`
//! frames behind loses the overflow and carries on; it catches up from
//! the next presence snapshot.
//!
//! A revocation is the one frame addressed to a single connection: it tells
//! that connection's session it no longer owns its presence entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::activity::{ActivityEvent, ActivityLog};
use crate::presence::{PresenceSnapshot, SessionId};
use crate::protocol::{LeaveReason, ProtocolError, ServerEvent, SplitUpdate};

/// An encoded frame as it goes out on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(Arc<str>),
    Binary(Arc<Vec<u8>>),
}

/// A frame plus routing metadata.
#[derive(Debug)]
pub struct Envelope {
    /// Position in the room's emission order.
    pub seq: u64,
    /// User that must not receive this frame.
    pub exclude: Option<String>,
    /// Set on revocations: the only session that receives this frame.
    pub revokes: Option<SessionId>,
    pub frame: Frame,
}

impl Envelope {
    fn is_for(&self, user_id: &str, session: SessionId) -> bool {
        match self.revokes {
            Some(target) => target == session,
            None => self.exclude.as_deref() != Some(user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct AtomicRouterStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Broadcast router of a single room.
#[derive(Debug)]
pub struct BroadcastRouter {
    sender: broadcast::Sender<Arc<Envelope>>,
    next_seq: AtomicU64,
    stats: Arc<AtomicRouterStats>,
    capacity: usize,
}

impl BroadcastRouter {
    /// `capacity` frames are buffered per subscriber before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_seq: AtomicU64::new(0),
            stats: Arc::new(AtomicRouterStats::default()),
            capacity: capacity.max(1),
        }
    }

    /// Receiver for `user_id` on connection `session`; frames excluded for
    /// that user are skipped.
    pub fn subscribe(&self, user_id: impl Into<String>, session: SessionId) -> RoomSubscription {
        RoomSubscription {
            user_id: user_id.into(),
            session,
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    fn send(&self, exclude: Option<&str>, revokes: Option<SessionId>, frame: Frame) -> usize {
        let envelope = Envelope {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            exclude: exclude.map(str::to_string),
            revokes,
            frame,
        };
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for a room.
        self.sender.send(Arc::new(envelope)).unwrap_or(0)
    }

    /// Encode once and send to every subscriber except `exclude`.
    pub fn publish(&self, event: &ServerEvent, exclude: Option<&str>) -> Result<usize, ProtocolError> {
        let text = event.encode()?;
        Ok(self.send(exclude, None, Frame::Text(Arc::from(text))))
    }

    /// Tell the subscription of `session` that it was taken out of the room.
    ///
    /// Only that subscription sees the `room-left` frame; its session drops
    /// the membership on receipt.
    pub fn revoke(&self, room_id: &str, session: SessionId, reason: LeaveReason) -> Result<usize, ProtocolError> {
        let event = ServerEvent::RoomLeft {
            room_id: room_id.to_string(),
            reason,
        };
        let text = event.encode()?;
        Ok(self.send(None, Some(session), Frame::Text(Arc::from(text))))
    }

    /// Relay a raw awareness update.
    pub fn publish_binary(&self, bytes: Vec<u8>, exclude: Option<&str>) -> usize {
        self.send(exclude, None, Frame::Binary(Arc::new(bytes)))
    }

    /// Send the room's full presence snapshot.
    ///
    /// On join pass `None` so the joiner sees itself; on presence mutations
    /// pass the mutating member so it is never echoed.
    pub fn broadcast_presence(
        &self,
        room_id: &str,
        members: PresenceSnapshot,
        exclude: Option<&str>,
    ) -> Result<usize, ProtocolError> {
        let event = ServerEvent::PresenceUpdate {
            room_id: room_id.to_string(),
            members,
        };
        self.publish(&event, exclude)
    }

    /// Append to the room log, then send to everyone.
    pub fn broadcast_activity(
        &self,
        log: &mut ActivityLog,
        event: ActivityEvent,
    ) -> Result<usize, ProtocolError> {
        log.push(event.clone());
        self.publish(&ServerEvent::ActivityNew { event }, None)
    }

    /// Forward an update to everyone except its sender.
    pub fn broadcast_update(
        &self,
        room_id: &str,
        update: &SplitUpdate,
        sender_id: &str,
    ) -> Result<usize, ProtocolError> {
        let event = ServerEvent::SplitUpdate {
            room_id: room_id.to_string(),
            update: update.clone(),
        };
        self.publish(&event, Some(sender_id))
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_sent: self.stats.sent.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One member's view of a room's broadcast stream.
#[derive(Debug)]
pub struct RoomSubscription {
    user_id: String,
    session: SessionId,
    rx: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicRouterStats>,
}

impl RoomSubscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Next frame addressed to this member.
    ///
    /// Returns `None` once the room is gone.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if !envelope.is_for(&self.user_id, self.session) {
                        continue;
                    }
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {} lagged, dropped {n} frames", self.user_id);
                    self.stats.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if !envelope.is_for(&self.user_id, self.session) {
                        continue;
                    }
                    return Some(envelope);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.stats.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}
