//! Session lifecycle: seed, serve, autosave, share, final save.
//!
//! ```text
//! start():  store.load ──► RoomServer::new ──► bind ──► tunnel.open ──► serve + autosave
//! stop():   server.shutdown ──► drain connections ──► store.save ──► tunnel.close
//! ```
//!
//! A failed initial load starts the room empty. A failed tunnel leaves the
//! session local-only. Neither stops the session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::element::ElementSet;
use crate::server::{RoomServer, ServerConfig, ServerError};
use crate::storage::{SceneStore, StoreError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub server: ServerConfig,
    /// Zero disables autosave; the final save still happens.
    pub autosave_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            server: ServerConfig::default(),
            autosave_interval: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            server: ServerConfig::for_testing(),
            autosave_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

/// Exposes the local server to remote participants.
pub trait ShareTunnel: Send {
    /// Open a tunnel to `local_addr` and return its public URL.
    fn open(&mut self, local_addr: SocketAddr) -> Result<String, SessionError>;

    fn close(&mut self);
}

pub struct SessionController {
    config: SessionConfig,
    store: Arc<dyn SceneStore>,
    tunnel: Option<Box<dyn ShareTunnel>>,
}

impl SessionController {
    pub fn new(config: SessionConfig, store: Arc<dyn SceneStore>) -> Self {
        Self {
            config,
            store,
            tunnel: None,
        }
    }

    pub fn with_tunnel(mut self, tunnel: Box<dyn ShareTunnel>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Seed the room, bind, open the tunnel and start serving.
    pub async fn start(self) -> Result<RunningSession, SessionError> {
        let Self {
            config,
            store,
            mut tunnel,
        } = self;

        let initial = match store.load_elements(&config.session_id) {
            Ok(elements) => {
                log::info!(
                    "Session {} loaded {} elements",
                    config.session_id,
                    elements.len()
                );
                elements
            }
            Err(e) => {
                log::error!("Loading session {} failed, starting empty: {e}", config.session_id);
                ElementSet::new()
            }
        };

        let server = Arc::new(RoomServer::new(
            config.server.clone(),
            config.session_id.clone(),
            initial,
        ));
        let listener = server.bind().await?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.server.bind_addr.clone(),
            source,
        })?;

        let mut public_url = None;
        if let Some(t) = tunnel.as_mut() {
            match t.open(local_addr) {
                Ok(url) => {
                    log::info!("Session {} shared at {url}", config.session_id);
                    public_url = Some(url);
                }
                Err(e) => {
                    log::warn!("Share tunnel failed, continuing local-only: {e}");
                    tunnel = None;
                }
            }
        }

        let serve_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let autosave_task = if config.autosave_interval.is_zero() {
            log::debug!("Autosave disabled for session {}", config.session_id);
            None
        } else {
            Some(tokio::spawn(autosave_loop(
                server.clone(),
                store.clone(),
                config.autosave_interval,
            )))
        };

        Ok(RunningSession {
            server,
            store,
            tunnel,
            local_addr,
            public_url,
            serve_task,
            autosave_task,
        })
    }

    /// Start, wait for `shutdown`, then stop.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        let session = self.start().await?;
        shutdown.await;
        session.stop().await
    }
}

/// A session that is serving participants.
pub struct RunningSession {
    server: Arc<RoomServer>,
    store: Arc<dyn SceneStore>,
    tunnel: Option<Box<dyn ShareTunnel>>,
    local_addr: SocketAddr,
    public_url: Option<String>,
    serve_task: JoinHandle<Result<(), ServerError>>,
    autosave_task: Option<JoinHandle<()>>,
}

impl RunningSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL for clients on this machine.
    pub fn local_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    pub fn server(&self) -> &RoomServer {
        &self.server
    }

    /// Persist the current scene now.
    pub async fn save(&self) -> Result<usize, SessionError> {
        Ok(persist(&self.server, self.store.as_ref()).await?)
    }

    /// Close every connection, save once more, close the tunnel.
    pub async fn stop(mut self) -> Result<(), SessionError> {
        log::info!("Stopping session {}", self.server.session_id());
        self.server.shutdown();
        if let Some(autosave) = self.autosave_task.take() {
            autosave.abort();
        }

        match (&mut self.serve_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Server stopped with error: {e}"),
            Err(e) => log::error!("Server task failed: {e}"),
        }

        let saved = persist(&self.server, self.store.as_ref()).await;

        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close();
        }

        match saved {
            Ok(count) => {
                log::info!("Final save: {count} elements");
                Ok(())
            }
            Err(e) => {
                log::error!("Final save failed: {e}");
                Err(e.into())
            }
        }
    }
}

async fn autosave_loop(server: Arc<RoomServer>, store: Arc<dyn SceneStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match persist(&server, store.as_ref()).await {
            Ok(count) => log::debug!("Autosaved {count} elements"),
            Err(e) => log::warn!("Autosave failed: {e}"),
        }
    }
}

async fn persist(server: &RoomServer, store: &dyn SceneStore) -> Result<usize, StoreError> {
    let elements = server.snapshot().await;
    store.save_elements(server.session_id(), &elements)?;
    Ok(elements.len())
}
