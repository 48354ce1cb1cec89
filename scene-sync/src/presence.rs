//! Presence: who is in the room, what color they draw with, where their
//! pointer is.
//!
//! ## Data flow
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! CursorThrottle::push()     (coalescing, ≤ 20 reports/s)
//!       │
//!       ▼
//! ClientMessage::CursorUpdate ──► RoomServer ──► ServerMessage::CursorUpdate
//!                                                     │
//!                                                     ▼
//!                                          PresenceTable::cursor()
//! ```
//!
//! The throttle is a coalescing one: positions reported inside an interval
//! overwrite each other, and only the newest is sent when the interval
//! closes. Nothing is queued.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::ParticipantSummary;

/// Minimum spacing between outbound cursor reports (20 reports/s).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// Presence colors handed out in join order.
pub const PRESENCE_PALETTE: [&str; 8] = [
    "#e03131", "#1971c2", "#2f9e44", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#c2255c",
];

/// Pointer position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
}

impl Pointer {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Round-robin color assignment over [`PRESENCE_PALETTE`].
///
/// Wraps around once every color has been handed out.
#[derive(Debug, Clone, Default)]
pub struct ColorRotation {
    next: usize,
}

impl ColorRotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self) -> String {
        let color = PRESENCE_PALETTE[self.next % PRESENCE_PALETTE.len()];
        self.next = self.next.wrapping_add(1);
        color.to_string()
    }
}

/// Coalescing throttle for outbound cursor reports.
///
/// A window opens on the first position pushed while idle. When the window
/// has lasted `interval`, the newest pending position is released and the
/// throttle goes idle again.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    window_start: Option<Instant>,
    pending: Option<Pointer>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            pending: None,
        }
    }

    /// Record a new position. Returns a position to send if the current
    /// window has already elapsed.
    pub fn push(&mut self, pointer: Pointer, now: Instant) -> Option<Pointer> {
        self.pending = Some(pointer);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.poll(now)
    }

    /// Release the pending position if its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Pointer> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.window_start = None;
        self.pending.take()
    }

    /// When the pending position becomes sendable, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.window_start, self.pending) {
            (Some(start), Some(_)) => Some(start + self.interval),
            _ => None,
        }
    }

    /// Drop any pending position (used when the connection resets).
    pub fn reset(&mut self) {
        self.window_start = None;
        self.pending = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}

/// A remote participant as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    pub name: String,
    pub color: String,
    /// Last reported pointer; `None` until the first cursor update.
    pub pointer: Option<Pointer>,
}

/// Client-side table of remote participants, keyed by display name.
#[derive(Debug, Clone, Default)]
pub struct PresenceTable {
    peers: HashMap<String, RemotePresence>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table from a full-state participant list.
    ///
    /// `local_name` is skipped so the local user never shows as remote.
    pub fn reset(&mut self, participants: &[ParticipantSummary], local_name: &str) {
        self.peers.clear();
        for p in participants.iter().filter(|p| p.name != local_name) {
            self.joined(&p.name, &p.color);
        }
    }

    pub fn joined(&mut self, name: &str, color: &str) {
        self.peers.insert(
            name.to_string(),
            RemotePresence {
                name: name.to_string(),
                color: color.to_string(),
                pointer: None,
            },
        );
    }

    pub fn left(&mut self, name: &str) -> Option<RemotePresence> {
        self.peers.remove(name)
    }

    /// Last-write-wins pointer update. Unknown names are added, since a
    /// cursor can arrive before the join event after a resync.
    pub fn cursor(&mut self, name: &str, color: &str, pointer: Pointer) {
        let entry = self
            .peers
            .entry(name.to_string())
            .or_insert_with(|| RemotePresence {
                name: name.to_string(),
                color: color.to_string(),
                pointer: None,
            });
        entry.pointer = Some(pointer);
    }

    pub fn get(&self, name: &str) -> Option<&RemotePresence> {
        self.peers.get(name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePresence> {
        self.peers.values()
    }
}
