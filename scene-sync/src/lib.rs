//! # scene-sync: real-time collaborative scene synchronization
//!
//! Keeps a shared drawing scene consistent across participants. Each
//! element carries a version and a random nonce; concurrent edits converge
//! by "highest version wins, lowest nonce breaks ties".
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ CollabClient │ ◄──────────────► │ RoomServer   │
//! │ (per user)   │    WebSocket     │ (one room)   │
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐      ┌──────────────────┐
//! │ ClientState  │                  │ RoomState    │ ◄──► │ SessionController│
//! │ merge()      │                  │ adopt newer  │      │ SceneStore       │
//! └──────────────┘                  └──────┬───────┘      └──────────────────┘
//!                                          │
//!                                   ┌──────┴───────┐
//!                                   │BroadcastGroup│
//!                                   │ (fan-out)    │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`]: versioned elements and ordered element sets
//! - [`merge`]: deterministic reconciliation rules
//! - [`protocol`]: tagged JSON wire messages
//! - [`presence`]: colors, cursor throttling, remote presence
//! - [`room`]: authoritative room state
//! - [`broadcast`]: fan-out excluding the originator
//! - [`server`]: WebSocket room server
//! - [`client`]: sync client with reconnect and resync
//! - [`storage`]: scene persistence (memory, RocksDB)
//! - [`session`]: session lifecycle and sharing hook

pub mod element;
pub mod merge;
pub mod protocol;
pub mod presence;
pub mod room;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod storage;
pub mod session;

// Re-exports for convenience
pub use element::{Element, ElementId, ElementSet};
pub use merge::{adopt_if_newer, merge, merge_into, resolve};
pub use protocol::{ClientMessage, ParticipantSummary, ProtocolError, ServerMessage};
pub use presence::{CursorThrottle, Pointer, PresenceTable, RemotePresence, PRESENCE_PALETTE};
pub use room::{Participant, ParticipantId, RoomState};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use server::{RoomServer, ServerConfig, ServerError, ServerStats};
pub use client::{
    ApplyMode, ClientConfig, ClientError, ClientEvent, ClientState, CollabClient,
    ConnectionState, LocalChange,
};
pub use storage::{MemoryStore, RocksSceneStore, SceneMetadata, SceneStore, StoreConfig, StoreError};
pub use session::{RunningSession, SessionConfig, SessionController, SessionError, ShareTunnel};
