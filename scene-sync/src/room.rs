//! Authoritative per-session room state.
//!
//! `RoomState` is plain data: the element map plus the participant
//! registry. It has no I/O and no locking; the server owns exactly one
//! instance behind a mutex and handles each message to completion against
//! it, so mutations are serialized.

use std::collections::HashMap;

use uuid::Uuid;

use crate::element::ElementSet;
use crate::merge::adopt_if_newer;
use crate::presence::{ColorRotation, Pointer};
use crate::protocol::{ParticipantSummary, ServerMessage};

/// Transport-level handle for a participant's connection.
pub type ParticipantId = Uuid;

/// A connected participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub color: String,
    /// Last reported pointer (`None` until the first cursor update).
    pub pointer: Option<Pointer>,
    /// Join order, used to list participants stably.
    seq: u64,
}

impl Participant {
    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary::new(&self.name, &self.color)
    }
}

/// One live collaborative session.
pub struct RoomState {
    session_id: String,
    elements: ElementSet,
    participants: HashMap<ParticipantId, Participant>,
    colors: ColorRotation,
    next_seq: u64,
}

impl RoomState {
    /// Create a room seeded with `elements` (empty for a fresh session).
    pub fn new(session_id: impl Into<String>, elements: ElementSet) -> Self {
        Self {
            session_id: session_id.into(),
            elements,
            participants: HashMap::new(),
            colors: ColorRotation::new(),
            next_seq: 0,
        }
    }

    /// Register a participant and assign the next presence color.
    pub fn join(&mut self, name: impl Into<String>) -> Participant {
        let participant = Participant {
            id: Uuid::new_v4(),
            name: name.into(),
            color: self.colors.assign(),
            pointer: None,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.participants.insert(participant.id, participant.clone());
        participant
    }

    /// Fold an incoming diff into authoritative state.
    ///
    /// Each element is adopted only if unknown or strictly newer. Returns
    /// how many were adopted.
    pub fn apply_scene_update(&mut self, diff: &ElementSet) -> usize {
        diff.iter()
            .filter(|incoming| adopt_if_newer(&mut self.elements, incoming))
            .count()
    }

    /// Record a participant's pointer. Returns the updated participant.
    pub fn update_cursor(&mut self, id: &ParticipantId, pointer: Pointer) -> Option<&Participant> {
        let participant = self.participants.get_mut(id)?;
        participant.pointer = Some(pointer);
        Some(participant)
    }

    pub fn leave(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participants in join order, name and color only.
    pub fn participant_summaries(&self) -> Vec<ParticipantSummary> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by_key(|p| p.seq);
        participants.into_iter().map(Participant::summary).collect()
    }

    /// The join / request-state reply.
    pub fn full_state(&self) -> ServerMessage {
        ServerMessage::FullState {
            elements: self.elements.clone(),
            participants: self.participant_summaries(),
        }
    }

    pub fn elements(&self) -> &ElementSet {
        &self.elements
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
