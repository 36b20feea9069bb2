//! Top-level error type.

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unauthorized: {0}")]
    Auth(#[from] AuthError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("room {room_id} is full ({limit} members)")]
    RoomFull { room_id: String, limit: usize },

    #[error("user id {claimed} does not match session identity {actual}")]
    IdentityMismatch { claimed: String, actual: String },

    #[error("not joined to room {0}")]
    NotJoined(String),

    #[error("connection has not joined a room")]
    NoRoom,

    #[error("not connected")]
    NotConnected,

    #[error("invalid awareness update: {0}")]
    Awareness(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;
