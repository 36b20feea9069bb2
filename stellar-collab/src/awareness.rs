//! CRDT awareness state of a room.
//!
//! Clients share cursor positions through a `yrs` document with a single
//! map, `cursors`, keyed by user id. Each value is a JSON string holding a
//! [`Cursor`]. Binary WebSocket frames carry v1-encoded updates of that
//! document; the server applies them to its room copy, relays them to the
//! other members, and folds the cursors back into presence.
//!
//! ```text
//! client A ──binary──► RoomAwareness::apply_update() ──► relay to B, C
//!                              │
//!                              ▼
//!                      cursors() ──► PresenceSet::set_cursor()
//! ```

use std::collections::BTreeMap;

use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, Out, ReadTxn, StateVector, Transact, Update};

use crate::presence::Cursor;

/// Name of the shared map holding cursor entries.
pub const CURSOR_MAP: &str = "cursors";

/// A per-room `yrs` document holding awareness entries.
pub struct RoomAwareness {
    doc: Doc,
}

impl Default for RoomAwareness {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomAwareness {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Apply a v1-encoded update received from a client.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    /// Decode every well-formed cursor entry.
    ///
    /// Entries that are not JSON cursors are skipped.
    pub fn cursors(&self) -> BTreeMap<String, Cursor> {
        let map = self.doc.get_or_insert_map(CURSOR_MAP);
        let txn = self.doc.transact();
        map.iter(&txn)
            .filter_map(|(user_id, value)| match value {
                Out::Any(Any::String(raw)) => serde_json::from_str::<Cursor>(&raw)
                    .ok()
                    .filter(Cursor::is_finite)
                    .map(|c| (user_id.to_string(), c)),
                _ => None,
            })
            .collect()
    }

    pub fn cursor(&self, user_id: &str) -> Option<Cursor> {
        self.cursors().remove(user_id)
    }

    /// Write a cursor entry and return the resulting update.
    pub fn set_cursor(&self, user_id: &str, cursor: Cursor) -> Vec<u8> {
        let raw = match serde_json::to_string(&cursor) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        self.write(|map, txn| {
            map.insert(txn, user_id, raw);
        })
    }

    /// Drop a user's entry and return the resulting update.
    ///
    /// Returns `None` when the user had no entry.
    pub fn remove(&self, user_id: &str) -> Option<Vec<u8>> {
        let map = self.doc.get_or_insert_map(CURSOR_MAP);
        let present = {
            let txn = self.doc.transact();
            map.contains_key(&txn, user_id)
        };
        if !present {
            return None;
        }
        Some(self.write(|map, txn| {
            map.remove(txn, user_id);
        }))
    }

    fn write(&self, f: impl FnOnce(&yrs::MapRef, &mut yrs::TransactionMut)) -> Vec<u8> {
        let map = self.doc.get_or_insert_map(CURSOR_MAP);
        let before = self.doc.transact().state_vector();
        let mut txn = self.doc.transact_mut();
        f(&map, &mut txn);
        txn.encode_diff_v1(&before)
    }

    pub fn has_entries(&self) -> bool {
        let map = self.doc.get_or_insert_map(CURSOR_MAP);
        let txn = self.doc.transact();
        map.len(&txn) > 0
    }

    /// Full document state, sent to a joining member.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}
