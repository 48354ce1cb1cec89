//! In-memory scene store for tests and throwaway sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{SceneStore, StoreError};
use crate::element::ElementSet;

#[derive(Default)]
pub struct MemoryStore {
    scenes: Mutex<HashMap<String, ElementSet>>,
    saves: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `elements` for `session_id`.
    pub fn with_scene(session_id: impl Into<String>, elements: ElementSet) -> Self {
        let store = Self::new();
        if let Ok(mut scenes) = store.scenes.lock() {
            scenes.insert(session_id.into(), elements);
        }
        store
    }

    /// Last saved elements for `session_id`.
    pub fn saved(&self, session_id: &str) -> Option<ElementSet> {
        self.scenes.lock().ok()?.get(session_id).cloned()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io("memory store set to fail".into()));
        }
        Ok(())
    }
}

impl SceneStore for MemoryStore {
    fn load_elements(&self, session_id: &str) -> Result<ElementSet, StoreError> {
        self.check()?;
        let scenes = self
            .scenes
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(scenes.get(session_id).cloned().unwrap_or_default())
    }

    fn save_elements(&self, session_id: &str, elements: &ElementSet) -> Result<(), StoreError> {
        self.check()?;
        self.scenes
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?
            .insert(session_id.to_string(), elements.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
