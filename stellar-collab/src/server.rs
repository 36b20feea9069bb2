//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── Session A ──┐
//!             ├── TcpListener ─ accept ┤               ├── CollabHub ── Room (split id)
//! Client B ──┘   (JWT handshake)      └── Session B ──┘                   │
//!                                                                ┌─────────┼──────────┐
//!                                                                ▼         ▼          ▼
//!                                                            Client A   Client B   Client C
//! ```
//!
//! Each connection runs one task that multiplexes three sources with
//! `tokio::select!`: frames from the socket, frames broadcast to the
//! connection's room, and the idle timer. Every incoming frame resets the
//! idle timer; when it fires the connection is dropped and cleaned up
//! exactly like a `leave-room`. Every frame, pings included, also refreshes
//! the member's presence; a background sweeper evicts members whose presence
//! went stale and tells their connection with `room-left`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::{authenticate, TokenVerifier};
use crate::broadcast::Frame;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::hub::CollabHub;
use crate::session::{Outgoing, Session};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl ConnectionCounters {
    fn record_frame(&self, len: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    verifier: Option<Arc<TokenVerifier>>,
    counters: Arc<ConnectionCounters>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(CollabHub::new(&config));
        let verifier = config
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(TokenVerifier::new(secret)));
        if verifier.is_none() {
            log::warn!("No JWT secret configured; connections are not authenticated");
        }
        Self {
            config,
            hub,
            verifier,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        let sweeper = self.spawn_idle_sweeper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let verifier = self.verifier.clone();
            let counters = self.counters.clone();
            let idle = self.config.idle_timeout();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, verifier, counters, idle).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    fn spawn_idle_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.hub.clone();
        let idle = self.config.idle_timeout();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match hub.evict_idle(idle).await {
                    Ok(evicted) if !evicted.is_empty() => {
                        log::info!("Evicted {} idle members", evicted.len());
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Idle sweep failed: {e}"),
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CollabHub>,
        verifier: Option<Arc<TokenVerifier>>,
        counters: Arc<ConnectionCounters>,
        idle: Duration,
    ) -> Result<()> {
        let mut identity = None;
        let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            match authenticate(verifier.as_deref(), request) {
                Ok(user) => {
                    identity = user;
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(tungstenite::Error::Http(response)) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected handshake from {addr}: {}", response.status());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let (ws_sender, ws_receiver) = ws_stream.split();

        counters.total.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection established from {addr} ({identity:?})");

        let mut session = Session::new(hub, identity);
        let result = Self::pump(&mut session, ws_sender, ws_receiver, &counters, idle, addr).await;

        // Same cleanup whether the peer left, failed, or went idle.
        session.close().await;
        counters.active.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} closed");
        result
    }

    async fn pump<W, R>(
        session: &mut Session,
        mut ws_sender: W,
        mut ws_receiver: R,
        counters: &ConnectionCounters,
        idle: Duration,
        addr: SocketAddr,
    ) -> Result<()>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        let idle_timer = tokio::time::sleep(idle);
        tokio::pin!(idle_timer);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    idle_timer.as_mut().reset(Instant::now() + idle);
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            counters.record_frame(text.len());
                            let replies = session.handle_text(text.as_str()).await;
                            send_all(&mut ws_sender, replies).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            counters.record_frame(data.len());
                            let replies = session.handle_binary(&data).await;
                            send_all(&mut ws_sender, replies).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            session.touch().await;
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => session.touch().await,
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Peer {addr} closed the connection");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing room broadcast
                frame = session.next_frame() => {
                    ws_sender.send(frame_to_message(&frame)).await?;
                }

                _ = &mut idle_timer => {
                    log::info!("Connection from {addr} idle for {idle:?}, dropping");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Snapshot of connection counters plus the live room count.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected.load(Ordering::Relaxed),
            total_messages: self.counters.messages.load(Ordering::Relaxed),
            total_bytes: self.counters.bytes.load(Ordering::Relaxed),
            active_rooms: self.hub.room_count().await,
        }
    }

    /// Hub handle, for server-side emission from other services.
    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn requires_auth(&self) -> bool {
        self.verifier.is_some()
    }
}

fn frame_to_message(frame: &Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.to_string().into()),
        Frame::Binary(bytes) => Message::Binary(bytes.as_ref().clone().into()),
    }
}

fn outgoing_to_message(outgoing: Outgoing) -> Result<Message> {
    Ok(match outgoing {
        Outgoing::Event(event) => Message::Text(event.encode()?.into()),
        Outgoing::Awareness(bytes) => Message::Binary(bytes.into()),
    })
}

async fn send_all<W>(ws_sender: &mut W, replies: Vec<Outgoing>) -> Result<()>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for reply in replies {
        ws_sender.send(outgoing_to_message(reply)?).await?;
    }
    Ok(())
}
