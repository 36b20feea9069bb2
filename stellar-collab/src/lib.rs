//! # stellar-collab: Real-time collaboration layer for StellarSplit
//!
//! Members editing the same bill split share presence (who is here, who is
//! typing, where their cursor is, which view they are on), a live activity
//! feed, and split updates. Near-simultaneous edits of the same field by
//! different members are held back as conflicts until someone resolves them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │  JSON + yrs binary │ (JWT, idle)  │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ Session (one per connection)
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │  CollabHub   │
//!                                     └──────┬───────┘
//!                                            │ SessionRegistry
//!                          ┌─────────────────┼─────────────────┐
//!                          ▼                 ▼                 ▼
//!                     Room "s1"          Room "s2"          Room "s3"
//!              presence · activity · conflicts · awareness · BroadcastRouter
//! ```
//!
//! ## Modules
//!
//! - [`presence`]: member presence of one room
//! - [`activity`]: bounded activity feed (newest first, 50 entries)
//! - [`conflict`]: conflict queue and the near-simultaneous write detector
//! - [`awareness`]: per-room `yrs` document carrying cursors
//! - [`broadcast`]: per-room fan-out with sender exclusion
//! - [`registry`]: room map with per-room serialization
//! - [`hub`]: the transport-agnostic service
//! - [`protocol`]: JSON event vocabulary
//! - [`session`]: per-connection state machine
//! - [`server`] / [`client`]: WebSocket transport
//! - [`auth`], [`config`], [`error`]: handshake JWT, settings, error types

pub mod activity;
pub mod auth;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use activity::{ActivityEvent, ActivityKind, ActivityLog, ACTIVITY_LOG_CAPACITY};
pub use auth::{AuthError, Claims, TokenVerifier};
pub use awareness::RoomAwareness;
pub use broadcast::{BroadcastRouter, Frame, RoomSubscription, RouterStats};
pub use client::{CollabClient, CollabEvent, ConnectionState};
pub use config::{ConfigError, ServerConfig};
pub use conflict::{ConflictDetector, ConflictInfo, ConflictQueue, Detection, Resolution};
pub use error::{CollabError, Result};
pub use hub::{CollabHub, JoinOutcome, UpdateOutcome};
pub use presence::{ActiveView, Cursor, Member, MemberProfile, PresenceSet, PresenceSnapshot};
pub use protocol::{ClientEvent, LeaveReason, NotificationKind, ProtocolError, ServerEvent, SplitUpdate};
pub use registry::SessionRegistry;
pub use server::{CollabServer, ServerStats};
pub use session::{Outgoing, Session};
