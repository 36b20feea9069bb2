//! Room registry: split id → live room.
//!
//! ```text
//! SessionRegistry
//!   └── RwLock<HashMap<room_id, Arc<Room>>>
//!          └── Room
//!               ├── Mutex<RoomState>   (presence, activity, conflicts, awareness)
//!               └── BroadcastRouter    (fan-out)
//! ```
//!
//! Every operation on a room runs under its state mutex, broadcast send
//! included, which fixes the emission order. The map lock is only taken to
//! look up, insert or delete a room. When both are needed the room lock is
//! taken first.
//!
//! A room is marked `closed` under its own lock when its last member
//! leaves, then removed from the map. A join that wins the race against
//! the removal sees the flag and retries on a fresh room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::activity::ActivityLog;
use crate::awareness::RoomAwareness;
use crate::broadcast::BroadcastRouter;
use crate::conflict::{ConflictDetector, ConflictQueue};
use crate::presence::PresenceSet;

/// Mutable state of one room.
pub struct RoomState {
    pub presence: PresenceSet,
    pub activity: ActivityLog,
    pub conflicts: ConflictQueue,
    pub detector: ConflictDetector,
    pub awareness: RoomAwareness,
    pub closed: bool,
}

pub struct Room {
    id: String,
    state: Mutex<RoomState>,
    router: BroadcastRouter,
}

impl Room {
    pub fn new(id: impl Into<String>, broadcast_capacity: usize, conflict_window: Duration) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RoomState {
                presence: PresenceSet::new(),
                activity: ActivityLog::new(),
                conflicts: ConflictQueue::new(),
                detector: ConflictDetector::new(conflict_window),
                awareness: RoomAwareness::new(),
                closed: false,
            }),
            router: BroadcastRouter::new(broadcast_capacity),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }
}

/// All live rooms.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    broadcast_capacity: usize,
    conflict_window: Duration,
}

impl SessionRegistry {
    pub fn new(broadcast_capacity: usize, conflict_window: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            conflict_window,
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Get or create a room.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        if let Some(room) = self.get(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(room_id, self.broadcast_capacity, self.conflict_window));
        rooms.insert(room_id.to_string(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }

    /// Drop `room` from the map if it is still the registered instance.
    ///
    /// Call with the room already marked closed.
    pub async fn remove(&self, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(room.id()) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room.id());
                log::debug!("Removed room {}", room.id());
                true
            }
            _ => false,
        }
    }

    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
