//! Collaboration client.
//!
//! Two layers:
//! - [`ClientState`]: the synchronous core. Holds the local element
//!   projection and the last-sent version of every element, computes
//!   outgoing diffs and folds remote diffs in with the merge resolver.
//! - [`CollabClient`]: the connection driver. Owns a WebSocket, runs the
//!   join / reconnect loop, throttles cursor reports and surfaces
//!   everything to the host editor as [`ClientEvent`]s.
//!
//! Connection lifecycle:
//! ```text
//! Disconnected ──► Connecting ──► Joined ──► Disconnected ──► Connecting ──► Joined ...
//!                                  (full-state received)  (backoff)   (join + request-state)
//! ```
//! The loop only ends when the client is torn down.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::element::{ElementId, ElementSet};
use crate::merge::{merge_into, supersedes};
use crate::presence::{
    CursorThrottle, Pointer, PresenceTable, RemotePresence, DEFAULT_CURSOR_INTERVAL,
};
use crate::protocol::{ClientMessage, ParticipantSummary, ProtocolError, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// What the client is doing with its element map right now.
///
/// Local edits are ignored while a remote diff is being applied, so a
/// change that came from the network is never sent back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    #[default]
    Idle,
    ApplyingRemote,
    Sending,
}

/// Result of feeding a local scene into [`ClientState::on_local_change`].
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// Nothing newer than what was already sent.
    Unchanged,
    /// These elements must go out as a scene-update.
    Send(ElementSet),
    /// A remote apply was in progress; the change was not examined.
    Suppressed,
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("Client has shut down")]
    Closed,
    #[error("Illegal mode transition from {from:?} to {to:?}")]
    IllegalTransition { from: ApplyMode, to: ApplyMode },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Synchronous client-side sync state.
///
/// Every remote delivery (snapshot or merged diff) bumps a revision. The
/// host reports its scene together with the revision it last rendered, so
/// an element delivered after that revision is never mistaken for a local
/// deletion just because the host has not drawn it yet.
#[derive(Debug, Default)]
pub struct ClientState {
    /// Mirror of the rendered scene plus remote results not yet rendered.
    elements: ElementSet,
    /// Version last sent to (or received from) the room, per element.
    sent_versions: HashMap<ElementId, u64>,
    /// Revision at which each element last arrived from the room.
    delivered: HashMap<ElementId, u64>,
    revision: u64,
    /// Revision current when the host last reported its scene.
    reported: u64,
    mode: ApplyMode,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything from a full-state snapshot.
    pub fn load_snapshot(&mut self, elements: ElementSet) {
        self.revision += 1;
        self.sent_versions = elements.versions();
        self.delivered = elements
            .ids()
            .map(|id| (id.clone(), self.revision))
            .collect();
        self.elements = elements;
    }

    /// [`on_local_change_at`](Self::on_local_change_at) for a host that does
    /// not track revisions.
    ///
    /// The host is assumed to have rendered whatever was delivered before
    /// its previous report; later deliveries are kept even when absent.
    pub fn on_local_change(&mut self, current: &ElementSet) -> Result<LocalChange, ClientError> {
        self.on_local_change_at(current, self.reported)
    }

    /// Compare the editor's current scene, drawn at revision `rendered`,
    /// against what was last sent.
    ///
    /// Elements absent from the tracking map, carrying a strictly greater
    /// version, or beating the held copy under the merge rule are returned
    /// for sending, and their versions recorded.
    /// An element missing from `current` is dropped from both maps only if
    /// it was not delivered after `rendered`. Stale copies in `current`
    /// never replace newer remote results. On [`LocalChange::Send`] the mode
    /// stays `Sending` until [`finish_send`](Self::finish_send).
    pub fn on_local_change_at(
        &mut self,
        current: &ElementSet,
        rendered: u64,
    ) -> Result<LocalChange, ClientError> {
        match self.mode {
            ApplyMode::Idle => {}
            ApplyMode::ApplyingRemote => {
                log::debug!("Local change during remote apply suppressed");
                return Ok(LocalChange::Suppressed);
            }
            ApplyMode::Sending => {
                return Err(ClientError::IllegalTransition {
                    from: ApplyMode::Sending,
                    to: ApplyMode::Sending,
                });
            }
        }

        let removed: Vec<ElementId> = self
            .elements
            .ids()
            .filter(|id| !current.contains(id))
            .filter(|id| self.delivered.get(*id).map_or(true, |&at| at <= rendered))
            .cloned()
            .collect();
        for id in &removed {
            self.elements.remove(id);
            self.sent_versions.remove(id);
            self.delivered.remove(id);
        }

        let mut changed = ElementSet::new();
        for element in current {
            let newer = self
                .sent_versions
                .get(&element.id)
                .map_or(true, |&sent| element.version > sent);
            // Same version, lower nonce than a copy merged meanwhile.
            let wins_tie = self
                .elements
                .get(&element.id)
                .is_some_and(|held| supersedes(element, held));
            if newer || wins_tie {
                self.sent_versions.insert(element.id.clone(), element.version);
                changed.insert(element.clone());
            }
        }
        merge_into(&mut self.elements, current);
        self.reported = self.revision;

        if changed.is_empty() {
            return Ok(LocalChange::Unchanged);
        }
        self.mode = ApplyMode::Sending;
        Ok(LocalChange::Send(changed))
    }

    /// The diff returned by `on_local_change` has been handed to the
    /// transport (or dropped while offline).
    pub fn finish_send(&mut self) {
        if self.mode == ApplyMode::Sending {
            self.mode = ApplyMode::Idle;
        }
    }

    pub fn begin_remote_apply(&mut self) -> Result<(), ClientError> {
        match self.mode {
            ApplyMode::Idle => {
                self.mode = ApplyMode::ApplyingRemote;
                Ok(())
            }
            from => Err(ClientError::IllegalTransition {
                from,
                to: ApplyMode::ApplyingRemote,
            }),
        }
    }

    /// Merge a remote diff into the local map (local side = current map).
    ///
    /// Every identifier in the diff has its tracked version set to the
    /// merged result, so the change is not sent back out.
    pub fn merge_remote(&mut self, diff: &ElementSet) -> Result<&ElementSet, ClientError> {
        if self.mode != ApplyMode::ApplyingRemote {
            return Err(ClientError::IllegalTransition {
                from: self.mode,
                to: ApplyMode::ApplyingRemote,
            });
        }
        self.revision += 1;
        merge_into(&mut self.elements, diff);
        for id in diff.ids() {
            if let Some(element) = self.elements.get(id) {
                self.sent_versions.insert(id.clone(), element.version);
                self.delivered.insert(id.clone(), self.revision);
            }
        }
        Ok(&self.elements)
    }

    pub fn finish_remote_apply(&mut self) {
        if self.mode == ApplyMode::ApplyingRemote {
            self.mode = ApplyMode::Idle;
        }
    }

    /// Begin, merge and finish in one call. Returns the merged scene.
    pub fn apply_remote(&mut self, diff: &ElementSet) -> Result<ElementSet, ClientError> {
        self.begin_remote_apply()?;
        let merged = self.merge_remote(diff).cloned();
        self.finish_remote_apply();
        merged
    }

    pub fn elements(&self) -> &ElementSet {
        &self.elements
    }

    pub fn mode(&self) -> ApplyMode {
        self.mode
    }

    /// Revision of the latest remote delivery.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn sent_version(&self, id: &str) -> Option<u64> {
        self.sent_versions.get(id).copied()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub display_name: String,
    /// Minimum spacing between cursor reports
    pub cursor_interval: Duration,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            display_name: display_name.into(),
            cursor_interval: DEFAULT_CURSOR_INTERVAL,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(10),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
}

/// Events surfaced to the host editor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// Full-state received: replace the scene wholesale.
    SceneReplaced {
        elements: ElementSet,
        participants: Vec<ParticipantSummary>,
        revision: u64,
    },
    /// A remote diff was merged; `elements` is the whole merged scene.
    SceneMerged {
        elements: ElementSet,
        from: String,
        revision: u64,
    },
    ParticipantJoined(ParticipantSummary),
    ParticipantLeft(String),
    RemoteCursor {
        name: String,
        color: String,
        pointer: Pointer,
    },
}

enum Command {
    LocalChange {
        elements: ElementSet,
        rendered: Option<u64>,
    },
    PointerMove(Pointer),
    RequestState,
    Elements(oneshot::Sender<ElementSet>),
    Participants(oneshot::Sender<Vec<RemotePresence>>),
    Shutdown,
}

enum Flow {
    Continue,
    Teardown,
}

enum SessionEnd {
    Dropped,
    Teardown,
}

/// Handle to a running collaboration client.
pub struct CollabClient {
    config: ClientConfig,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl CollabClient {
    /// Connect and join.
    ///
    /// Fails only if the first connection cannot be established. After
    /// that, drops are retried in the background until
    /// [`disconnect`](Self::disconnect).
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let ws = match tokio_tungstenite::connect_async(config.server_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::error!("Could not connect to {}: {e}", config.server_url);
                return Err(ClientError::ConnectionFailed {
                    url: config.server_url.clone(),
                    reason: e.to_string(),
                });
            }
        };
        log::info!("Connected to {} as {}", config.server_url, config.display_name);

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            throttle: CursorThrottle::new(config.cursor_interval),
            config: config.clone(),
            state: ClientState::new(),
            presence: PresenceTable::new(),
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
        };
        let handle = tokio::spawn(driver.run(ws));

        Ok(Self {
            config,
            commands: cmd_tx,
            state: status_rx,
            event_rx: Some(event_rx),
            driver: Some(handle),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Report the editor's current scene after a local edit.
    ///
    /// Without a revision, elements that arrived after the previous report
    /// are kept even if `elements` lacks them. Use
    /// [`local_change_at`](Self::local_change_at) when the host tracks the
    /// revision of the last scene it rendered.
    pub async fn local_change(&self, elements: ElementSet) -> Result<(), ClientError> {
        self.command(Command::LocalChange {
            elements,
            rendered: None,
        })
        .await
    }

    /// Report the editor's scene as drawn from the `SceneReplaced` or
    /// `SceneMerged` event carrying `revision`.
    pub async fn local_change_at(
        &self,
        elements: ElementSet,
        revision: u64,
    ) -> Result<(), ClientError> {
        self.command(Command::LocalChange {
            elements,
            rendered: Some(revision),
        })
        .await
    }

    /// Report a pointer move. Reports are coalesced by the cursor throttle.
    pub async fn move_pointer(&self, pointer: Pointer) -> Result<(), ClientError> {
        self.command(Command::PointerMove(pointer)).await
    }

    /// Ask the server for a fresh full-state snapshot.
    pub async fn request_state(&self) -> Result<(), ClientError> {
        self.command(Command::RequestState).await
    }

    /// The client's current local element map.
    pub async fn elements(&self) -> Result<ElementSet, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Elements(tx)).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Remote participants, sorted by name.
    pub async fn participants(&self) -> Result<Vec<RemotePresence>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Participants(tx)).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait up to `timeout` for the connection to reach `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    async fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands.send(cmd).await.map_err(|_| ClientError::Closed)
    }
}

/// Background task owning the socket and the sync state.
struct Driver {
    config: ClientConfig,
    state: ClientState,
    presence: PresenceTable,
    throttle: CursorThrottle,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(mut self, first: WsStream) {
        let mut ws = first;
        let mut rejoin = false;

        loop {
            if let SessionEnd::Teardown = self.session(ws, rejoin).await {
                break;
            }
            self.set_status(ConnectionState::Disconnected);
            self.throttle.reset();
            rejoin = true;

            match self.reconnect().await {
                Some(next) => ws = next,
                None => break,
            }
        }

        self.set_status(ConnectionState::Disconnected);
        log::info!("Collaboration client {} stopped", self.config.display_name);
    }

    /// Run one connection until it drops or the client is torn down.
    async fn session(&mut self, ws: WsStream, rejoin: bool) -> SessionEnd {
        self.set_status(ConnectionState::Connecting);
        let (mut sink, mut source) = ws.split();

        let join = ClientMessage::Join {
            name: self.config.display_name.clone(),
        };
        if let Err(e) = send_message(&mut sink, &join).await {
            log::warn!("Join failed: {e}");
            return SessionEnd::Dropped;
        }
        // The server forgot us when the old socket dropped; join again, then
        // resync explicitly.
        if rejoin {
            if let Err(e) = send_message(&mut sink, &ClientMessage::RequestState).await {
                log::warn!("Request-state failed: {e}");
                return SessionEnd::Dropped;
            }
        }

        loop {
            let cursor_deadline = self.throttle.deadline();

            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Teardown;
                    };
                    match self.handle_command(cmd, Some(&mut sink)).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Teardown) => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Teardown;
                        }
                        Err(e) => {
                            log::warn!("Send failed: {e}");
                            return SessionEnd::Dropped;
                        }
                    }
                }

                _ = sleep_until(cursor_deadline) => {
                    if let Some(pointer) = self.throttle.poll(Instant::now()) {
                        if let Err(e) = send_message(&mut sink, &ClientMessage::CursorUpdate { pointer }).await {
                            log::warn!("Cursor send failed: {e}");
                            return SessionEnd::Dropped;
                        }
                    }
                }

                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                            Ok(msg) => self.handle_server_message(msg),
                            Err(e) => log::warn!("Ignoring malformed server message: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Server closed the connection");
                            return SessionEnd::Dropped;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Connection lost: {e}");
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }

    /// Back off and retry until a socket opens. `None` means teardown.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut delay = self.config.reconnect_delay;

        loop {
            let retry = tokio::time::sleep(delay);
            tokio::pin!(retry);

            loop {
                tokio::select! {
                    cmd = self.commands.recv() => {
                        let cmd = cmd?;
                        match self.handle_command(cmd, None).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Teardown) => return None,
                            Err(e) => log::warn!("Offline command failed: {e}"),
                        }
                    }
                    _ = &mut retry => break,
                }
            }

            self.set_status(ConnectionState::Connecting);
            match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Reconnected to {}", self.config.server_url);
                    return Some(ws);
                }
                Err(e) => {
                    log::warn!("Reconnect to {} failed: {e}; next try in {delay:?}", self.config.server_url);
                    self.set_status(ConnectionState::Disconnected);
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    /// `sink` is `None` while disconnected.
    async fn handle_command(
        &mut self,
        cmd: Command,
        sink: Option<&mut WsSink>,
    ) -> Result<Flow, ClientError> {
        match cmd {
            Command::LocalChange { elements, rendered } => {
                match self.local_change(&elements, rendered) {
                    Ok(LocalChange::Send(diff)) => {
                        let result = match sink {
                            Some(sink) => {
                                log::debug!("Sending {} changed elements", diff.len());
                                let msg = ClientMessage::SceneUpdate { elements: diff };
                                send_message(sink, &msg).await
                            }
                            None => {
                                log::debug!(
                                    "Offline; {} changed elements wait for resync",
                                    diff.len()
                                );
                                Ok(())
                            }
                        };
                        self.state.finish_send();
                        result?;
                    }
                    Ok(LocalChange::Unchanged) | Ok(LocalChange::Suppressed) => {}
                    Err(e) => log::error!("Local change rejected: {e}"),
                }
            }

            Command::PointerMove(pointer) => {
                if let Some(sink) = sink {
                    if let Some(pointer) = self.throttle.push(pointer, Instant::now()) {
                        send_message(sink, &ClientMessage::CursorUpdate { pointer }).await?;
                    }
                }
            }

            Command::RequestState => {
                if let Some(sink) = sink {
                    send_message(sink, &ClientMessage::RequestState).await?;
                }
            }

            Command::Elements(reply) => {
                let _ = reply.send(self.state.elements().clone());
            }

            Command::Participants(reply) => {
                let mut peers: Vec<RemotePresence> = self.presence.iter().cloned().collect();
                peers.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(peers);
            }

            Command::Shutdown => return Ok(Flow::Teardown),
        }
        Ok(Flow::Continue)
    }

    fn local_change(
        &mut self,
        elements: &ElementSet,
        rendered: Option<u64>,
    ) -> Result<LocalChange, ClientError> {
        match rendered {
            Some(revision) => self.state.on_local_change_at(elements, revision),
            None => self.state.on_local_change(elements),
        }
    }

    fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::FullState {
                elements,
                participants,
            } => {
                log::debug!(
                    "Full state: {} elements, {} participants",
                    elements.len(),
                    participants.len()
                );
                self.state.load_snapshot(elements.clone());
                self.presence.reset(&participants, &self.config.display_name);
                self.set_status(ConnectionState::Joined);
                self.emit(ClientEvent::SceneReplaced {
                    elements,
                    participants,
                    revision: self.state.revision(),
                });
            }

            ServerMessage::SceneUpdate { elements, from } => {
                if let Err(e) = self.state.begin_remote_apply() {
                    log::error!("Cannot apply update from {from}: {e}");
                    return;
                }
                let merged = self.state.merge_remote(&elements).cloned();
                match merged {
                    Ok(merged) => self.emit(ClientEvent::SceneMerged {
                        elements: merged,
                        from,
                        revision: self.state.revision(),
                    }),
                    Err(e) => log::error!("Merge from {from} failed: {e}"),
                }
                self.state.finish_remote_apply();
            }

            ServerMessage::CursorUpdate {
                pointer,
                name,
                color,
            } => {
                self.presence.cursor(&name, &color, pointer);
                self.emit(ClientEvent::RemoteCursor {
                    name,
                    color,
                    pointer,
                });
            }

            ServerMessage::ParticipantJoined { name, color } => {
                log::info!("{name} joined");
                self.presence.joined(&name, &color);
                self.emit(ClientEvent::ParticipantJoined(ParticipantSummary::new(
                    name, color,
                )));
            }

            ServerMessage::ParticipantLeft { name } => {
                log::info!("{name} left");
                self.presence.left(&name);
                self.emit(ClientEvent::ParticipantLeft(name));
            }
        }
    }

    fn set_status(&mut self, status: ConnectionState) {
        if *self.status.borrow() == status {
            return;
        }
        self.status.send_replace(status);
        self.emit(ClientEvent::StateChanged(status));
    }

    fn emit(&self, event: ClientEvent) {
        // The host may have dropped its receiver; sync carries on regardless.
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn send_message(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), ClientError> {
    let text = msg.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
