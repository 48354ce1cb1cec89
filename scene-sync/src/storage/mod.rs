//! Scene persistence.
//!
//! The room server keeps everything in memory. Durability belongs to the
//! session controller, which seeds the room from a [`SceneStore`] at
//! startup, autosaves on an interval and saves once more on shutdown.
//!
//! ```text
//! ┌────────────────────┐  load / save   ┌──────────────────────────────────┐
//! │ SessionController  │ ─────────────► │ SceneStore                        │
//! └────────────────────┘                │  MemoryStore      (tests)        │
//!                                       │  RocksSceneStore  (CF "scenes",  │
//!                                       │                    CF "metadata")│
//!                                       └──────────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksSceneStore, SceneMetadata, StoreConfig};

use thiserror::Error;

use crate::element::ElementSet;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Where a session's element set lives between runs.
///
/// Calls are synchronous and short; the controller invokes them from the
/// async runtime directly.
pub trait SceneStore: Send + Sync {
    /// Load the elements for `session_id`. An unknown session is an empty set.
    fn load_elements(&self, session_id: &str) -> Result<ElementSet, StoreError>;

    /// Replace the stored elements for `session_id`.
    fn save_elements(&self, session_id: &str, elements: &ElementSet) -> Result<(), StoreError>;
}
