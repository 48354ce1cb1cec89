//! Fan-out of server messages to every participant except the originator.
//!
//! Uses a tokio broadcast channel: one `send` reaches every subscribed
//! connection task. Each frame is encoded once and shared as `Arc<str>`.
//! Every frame carries its origin, and each connection task drops frames
//! that came from its own participant, so the sender never gets an echo.
//!
//! A subscriber that falls more than `capacity` frames behind gets a lag
//! notice instead of the frames it missed. The server answers a lag notice
//! with a fresh full-state snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::room::ParticipantId;

/// An encoded frame on its way to the room.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Participant the frame originated from (`None` = server-originated).
    pub origin: Option<ParticipantId>,
    pub frame: Arc<str>,
}

impl Outbound {
    /// Whether `participant` should receive this frame.
    pub fn is_for(&self, participant: Option<ParticipantId>) -> bool {
        match (self.origin, participant) {
            (Some(origin), Some(me)) => origin != me,
            _ => true,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

/// Broadcast group for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each subscriber may buffer before it
    /// starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe a connection to the room's traffic.
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.sender.subscribe()
    }

    /// Encode `msg` once and fan it out.
    ///
    /// Returns the number of subscribers reached (the originator included;
    /// receivers filter with [`Outbound::is_for`]).
    pub fn broadcast(
        &self,
        msg: &ServerMessage,
        origin: Option<ParticipantId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = Arc::from(msg.encode()?);
        Ok(self.broadcast_raw(Outbound { origin, frame }))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_raw(&self, outbound: Outbound) -> usize {
        // No subscribers is not an error: an empty room simply drops it.
        let count = self.sender.send(outbound).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a subscriber skipped `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
