//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌──────────────────────────┐
//!            ├── connection ──►│ RoomHandle::dispatch()   │
//! Client B ──┘    tasks        │   Mutex<RoomState>       │──► BroadcastGroup
//!                              └──────────────────────────┘        │
//!                                                         ┌────────┼────────┐
//!                                                         ▼        ▼        ▼
//!                                                     Client A  Client B  Client C
//!                                                     (origin frames filtered out)
//! ```
//!
//! One server owns one room. Every incoming message is dispatched to
//! completion under the room lock, and any resulting broadcast is queued
//! before the lock is released, so relay order always matches apply order.
//! Network I/O happens outside the lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Outbound};
use crate::element::ElementSet;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::{Participant, ParticipantId, RoomState};

/// How long shutdown waits for connections to close before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames each connection may buffer before it lags
    pub broadcast_capacity: usize,
    /// Joins beyond this are refused
    pub max_participants: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_participants: 100,
        }
    }
}

impl ServerConfig {
    /// Ephemeral loopback port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            max_participants: 16,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub scene_updates: u64,
    pub elements_adopted: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    malformed_messages: AtomicU64,
    scene_updates: AtomicU64,
    elements_adopted: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            scene_updates: self.scene_updates.load(Ordering::Relaxed),
            elements_adopted: self.elements_adopted.load(Ordering::Relaxed),
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outcome of dispatching one client message.
#[derive(Debug)]
enum Reply {
    Nothing,
    Send(ServerMessage),
    Refuse(&'static str),
}

/// Per-connection state.
#[derive(Default)]
struct ConnectionSession {
    participant: Option<Participant>,
    relay: Option<broadcast::Receiver<Outbound>>,
}

impl ConnectionSession {
    fn participant_id(&self) -> Option<ParticipantId> {
        self.participant.as_ref().map(|p| p.id)
    }
}

/// Everything a connection task needs to reach the room.
#[derive(Clone)]
struct RoomHandle {
    state: Arc<Mutex<RoomState>>,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<AtomicServerStats>,
    max_participants: usize,
}

impl RoomHandle {
    /// Apply one client message against the room.
    async fn dispatch(&self, session: &mut ConnectionSession, msg: ClientMessage) -> Reply {
        let mut state = self.state.lock().await;

        match msg {
            ClientMessage::Join { name } => {
                if session.participant.is_some() {
                    log::debug!("Repeated join from {name}; resending state");
                    return Reply::Send(state.full_state());
                }
                if state.participant_count() >= self.max_participants {
                    return Reply::Refuse("room is full");
                }

                let participant = state.join(name);
                session.relay = Some(self.broadcast.subscribe());
                self.announce(
                    &ServerMessage::ParticipantJoined {
                        name: participant.name.clone(),
                        color: participant.color.clone(),
                    },
                    Some(participant.id),
                );
                log::info!(
                    "{} joined room {} as {} ({} present)",
                    participant.name,
                    state.session_id(),
                    participant.color,
                    state.participant_count()
                );

                let reply = state.full_state();
                session.participant = Some(participant);
                Reply::Send(reply)
            }

            ClientMessage::SceneUpdate { elements } => {
                let Some(participant) = &session.participant else {
                    log::warn!("Ignoring scene-update before join");
                    return Reply::Nothing;
                };
                if elements.is_empty() {
                    return Reply::Nothing;
                }

                let adopted = state.apply_scene_update(&elements);
                self.stats.scene_updates.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .elements_adopted
                    .fetch_add(adopted as u64, Ordering::Relaxed);
                log::debug!(
                    "{} sent {} elements, {} adopted",
                    participant.name,
                    elements.len(),
                    adopted
                );

                self.announce(
                    &ServerMessage::SceneUpdate {
                        elements,
                        from: participant.name.clone(),
                    },
                    Some(participant.id),
                );
                Reply::Nothing
            }

            ClientMessage::CursorUpdate { pointer } => {
                let Some(participant) = &session.participant else {
                    log::warn!("Ignoring cursor-update before join");
                    return Reply::Nothing;
                };
                if state.update_cursor(&participant.id, pointer).is_none() {
                    return Reply::Nothing;
                }
                log::trace!("Cursor from {} at ({}, {})", participant.name, pointer.x, pointer.y);

                self.announce(
                    &ServerMessage::CursorUpdate {
                        pointer,
                        name: participant.name.clone(),
                        color: participant.color.clone(),
                    },
                    Some(participant.id),
                );
                Reply::Nothing
            }

            ClientMessage::RequestState => Reply::Send(state.full_state()),
        }
    }

    /// Remove the connection's participant and tell everyone else.
    async fn depart(&self, session: &mut ConnectionSession) {
        session.relay = None;
        let Some(participant) = session.participant.take() else {
            return;
        };

        let mut state = self.state.lock().await;
        state.leave(&participant.id);
        self.announce(
            &ServerMessage::ParticipantLeft {
                name: participant.name.clone(),
            },
            Some(participant.id),
        );
        log::info!(
            "{} left room {} ({} remaining)",
            participant.name,
            state.session_id(),
            state.participant_count()
        );
    }

    fn announce(&self, msg: &ServerMessage, origin: Option<ParticipantId>) {
        if let Err(e) = self.broadcast.broadcast(msg, origin) {
            log::error!("Failed to broadcast {}: {e}", msg.kind());
        }
    }
}

/// The room server.
pub struct RoomServer {
    config: ServerConfig,
    session_id: String,
    room: RoomHandle,
    shutdown: watch::Sender<bool>,
}

impl RoomServer {
    /// Create a server for `session_id`, seeded with `initial` elements.
    pub fn new(config: ServerConfig, session_id: impl Into<String>, initial: ElementSet) -> Self {
        let session_id = session_id.into();
        let room = RoomHandle {
            state: Arc::new(Mutex::new(RoomState::new(session_id.clone(), initial))),
            broadcast: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            stats: Arc::new(AtomicServerStats::default()),
            max_participants: config.max_participants,
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            session_id,
            room,
            shutdown,
        }
    }

    /// Default configuration, empty room.
    pub fn with_defaults(session_id: impl Into<String>) -> Self {
        Self::new(ServerConfig::default(), session_id, ElementSet::new())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then wait for every
    /// connection task to close.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Ok(addr) = listener.local_addr() {
            log::info!("Room {} listening on {addr}", self.session_id);
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let room = self.room.clone();
                    let shutdown_rx = self.shutdown.subscribe();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, room, shutdown_rx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        log::info!("Room {} shutting down, closing {} connections", self.session_id, connections.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Connections did not close within {SHUTDOWN_GRACE:?}; aborting");
            connections.abort_all();
        }
        Ok(())
    }

    /// Stop accepting and close every participant connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Copy of the authoritative element set.
    pub async fn snapshot(&self) -> ElementSet {
        self.room.state.lock().await.elements().clone()
    }

    pub async fn participant_count(&self) -> usize {
        self.room.state.lock().await.participant_count()
    }

    pub fn stats(&self) -> ServerStats {
        self.room.stats.snapshot()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.room.broadcast.stats()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle a single WebSocket connection from handshake to cleanup.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    room: RoomHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();

    // Shutdown may have fired before this receiver was subscribed; that
    // value counts as seen and `changed()` would never report it.
    if *shutdown.borrow_and_update() {
        log::debug!("Shutting down; closing {addr} right after handshake");
        let _ = sink.send(Message::Close(None)).await;
        return Ok(());
    }
    log::info!("WebSocket connection established from {addr}");

    room.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    room.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut session = ConnectionSession::default();

    let outcome: Result<(), ServerError> = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }

            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        room.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        let msg = match ClientMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                room.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Ignoring malformed message from {addr}: {e}");
                                continue;
                            }
                        };
                        log::trace!("{} from {addr}", msg.kind());

                        match room.dispatch(&mut session, msg).await {
                            Reply::Nothing => {}
                            Reply::Send(reply) => {
                                if let Err(e) = send_message(&mut sink, &reply).await {
                                    break Err(e);
                                }
                            }
                            Reply::Refuse(reason) => {
                                log::warn!("Refusing {addr}: {reason}");
                                let _ = sink.send(Message::Close(None)).await;
                                break Ok(());
                            }
                        }
                    }

                    Some(Ok(Message::Binary(_))) => {
                        room.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Ignoring binary frame from {addr}");
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }

                    Some(Ok(_)) => {}

                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break Err(e.into());
                    }
                }
            }

            relayed = next_relay(&mut session.relay) => {
                match relayed {
                    Ok(outbound) => {
                        if !outbound.is_for(session.participant_id()) {
                            continue;
                        }
                        if let Err(e) = sink.send(Message::Text(outbound.frame.to_string().into())).await {
                            break Err(e.into());
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Missed frames cannot be replayed; resync instead.
                        log::warn!("{addr} lagged by {n} messages; sending full state");
                        room.broadcast.record_lag(n);
                        let snapshot = room.state.lock().await.full_state();
                        if let Err(e) = send_message(&mut sink, &snapshot).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    room.depart(&mut session).await;
    room.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    outcome
}

async fn next_relay(
    relay: &mut Option<broadcast::Receiver<Outbound>>,
) -> Result<Outbound, RecvError> {
    match relay {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_message(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), ServerError> {
    let text = msg.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
