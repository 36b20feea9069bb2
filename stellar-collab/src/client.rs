//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Explicit connection lifecycle (`connect`, `disconnect`); no global socket
//! - Typed server events on an mpsc channel
//! - Automatic re-join of the current split after reconnecting
//! - Cursor sharing through a local `yrs` awareness document
//!
//! ```text
//! app ──► CollabClient::send_*() ──► mpsc ──► writer task ──► socket
//! app ◄── event_rx ◄── reader task ◄────────────────────────── socket
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::activity::ActivityKind;
use crate::awareness::RoomAwareness;
use crate::conflict::Resolution;
use crate::error::{CollabError, Result};
use crate::presence::{ActiveView, Cursor, MemberProfile};
use crate::protocol::{ClientEvent, ServerEvent, SplitUpdate};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    Connected,
    Disconnected,
    /// Any JSON event from the server
    Server(ServerEvent),
    /// Raw awareness update (room state on join, or another member's cursor)
    Awareness(Vec<u8>),
}

pub struct CollabClient {
    server_url: String,
    token: Option<String>,
    profile: MemberProfile,

    /// Split we are in; re-joined after every reconnect
    room_id: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,

    /// Local awareness replica; reset on every join
    awareness: RoomAwareness,

    reader: Option<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, profile: MemberProfile) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            server_url: server_url.into(),
            token: None,
            profile,
            room_id: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            awareness: RoomAwareness::new(),
            reader: None,
        }
    }

    /// Authenticate the handshake with a JWT.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    fn connect_url(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.server_url.contains('?') { '&' } else { '?' };
                format!("{}{sep}token={token}", self.server_url)
            }
            None => self.server_url.clone(),
        }
    }

    /// Connect to the server and re-join the current split, if any.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<()> {
        if self.outgoing_tx.is_some() {
            self.disconnect().await;
        }
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.connect_url()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => CollabEvent::Server(event),
                        Err(e) => {
                            log::warn!("Ignoring undecodable server frame: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Binary(data)) => CollabEvent::Awareness(data.to_vec()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(CollabEvent::Disconnected).await;
        }));

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(CollabEvent::Connected);
        log::info!("Connected to {}", self.server_url);

        if let Some(room_id) = self.room_id.clone() {
            log::info!("Re-joining split {room_id}");
            self.join_split(&room_id).await?;
        }
        Ok(())
    }

    /// Leave the current split (the membership is kept for the next
    /// `connect`) and close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(room_id) = self.room_id.clone() {
            let leave = ClientEvent::LeaveRoom {
                room_id,
                user_id: Some(self.profile.user_id.clone()),
            };
            let _ = self.send_event(&leave).await;
        }
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.try_send(CollabEvent::Disconnected);
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(CollabError::NotConnected);
        }
        let text = event.encode()?;
        self.send_raw(Message::Text(text.into())).await
    }

    async fn send_raw(&self, msg: Message) -> Result<()> {
        let tx = self.outgoing_tx.as_ref().ok_or(CollabError::NotConnected)?;
        tx.send(msg).await.map_err(|_| CollabError::NotConnected)
    }

    fn current_room(&self) -> Result<String> {
        self.room_id.clone().ok_or(CollabError::NoRoom)
    }

    // ───────────────────────────────────────────────────────────────
    // Membership & presence
    // ───────────────────────────────────────────────────────────────

    /// Join a split room; leaves the previous one server-side.
    pub async fn join_split(&mut self, room_id: &str) -> Result<()> {
        self.room_id = Some(room_id.to_string());
        self.awareness = RoomAwareness::new();
        let join = ClientEvent::JoinRoom {
            room_id: room_id.to_string(),
            user: self.profile.clone(),
        };
        self.send_event(&join).await
    }

    pub async fn leave_split(&mut self) -> Result<()> {
        let room_id = self.room_id.take().ok_or(CollabError::NoRoom)?;
        let leave = ClientEvent::LeaveRoom {
            room_id,
            user_id: Some(self.profile.user_id.clone()),
        };
        self.send_event(&leave).await
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<()> {
        let event = ClientEvent::TypingStatus {
            room_id: self.current_room()?,
            user_id: Some(self.profile.user_id.clone()),
            is_typing,
        };
        self.send_event(&event).await
    }

    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<()> {
        let event = ClientEvent::CursorUpdate {
            room_id: self.current_room()?,
            user_id: Some(self.profile.user_id.clone()),
            x,
            y,
        };
        self.send_event(&event).await
    }

    /// Share the cursor through the awareness document instead of JSON.
    pub async fn share_cursor(&self, cursor: Cursor) -> Result<()> {
        self.current_room()?;
        if *self.state.read().await != ConnectionState::Connected {
            return Err(CollabError::NotConnected);
        }
        let update = self.awareness.set_cursor(&self.profile.user_id, cursor);
        self.send_raw(Message::Binary(update.into())).await
    }

    pub async fn set_active_view(&self, view: ActiveView) -> Result<()> {
        let event = ClientEvent::ActiveView {
            room_id: self.current_room()?,
            user_id: Some(self.profile.user_id.clone()),
            view,
        };
        self.send_event(&event).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send_event(&ClientEvent::Heartbeat).await
    }

    // ───────────────────────────────────────────────────────────────
    // Updates, conflicts, activity
    // ───────────────────────────────────────────────────────────────

    pub async fn send_update(&self, mut update: SplitUpdate) -> Result<()> {
        update.user_id = self.profile.user_id.clone();
        let event = ClientEvent::SplitUpdate {
            room_id: self.current_room()?,
            update,
        };
        self.send_event(&event).await
    }

    /// Confirm a received update so the next edit of `field` is not a conflict.
    pub async fn acknowledge(&self, field: &str) -> Result<()> {
        let event = ClientEvent::AckUpdate {
            room_id: self.current_room()?,
            field: field.to_string(),
        };
        self.send_event(&event).await
    }

    pub async fn resolve_conflict(&self, field: &str, resolution: Resolution) -> Result<()> {
        let event = ClientEvent::ResolveConflict {
            room_id: self.current_room()?,
            field: field.to_string(),
            resolution,
        };
        self.send_event(&event).await
    }

    pub async fn record_activity(&self, kind: ActivityKind, message: impl Into<String>) -> Result<()> {
        let event = ClientEvent::Activity {
            room_id: self.current_room()?,
            kind,
            message: message.into(),
        };
        self.send_event(&event).await
    }

    // ───────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn profile(&self) -> &MemberProfile {
        &self.profile
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> CollabClient {
        CollabClient::new("ws://127.0.0.1:1", MemberProfile::new("u1", "Alice"))
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = client();
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.server_url(), "ws://127.0.0.1:1");
        assert_eq!(client.profile().user_id, "u1");
        assert!(client.room_id().is_none());
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_connect_url_with_token() {
        let plain = client();
        assert_eq!(plain.connect_url(), "ws://127.0.0.1:1");

        let authed = client().with_token("abc");
        assert_eq!(authed.connect_url(), "ws://127.0.0.1:1?token=abc");

        let with_query = CollabClient::new("ws://h/ws?v=1", MemberProfile::new("u1", "A")).with_token("abc");
        assert_eq!(with_query.connect_url(), "ws://h/ws?v=1&token=abc");
    }

    #[tokio::test]
    async fn test_operations_require_room() {
        let client = client();
        assert!(matches!(client.set_typing(true).await, Err(CollabError::NoRoom)));
        assert!(matches!(
            client.send_update(SplitUpdate::new("x", json!({}))).await,
            Err(CollabError::NoRoom)
        ));
    }

    #[tokio::test]
    async fn test_join_while_disconnected_is_remembered() {
        let mut client = client();
        let err = client.join_split("s1").await.unwrap_err();
        assert!(matches!(err, CollabError::NotConnected));
        // Remembered for the next connect.
        assert_eq!(client.room_id(), Some("s1"));
        assert!(matches!(client.heartbeat().await, Err(CollabError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let mut client = client();
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
