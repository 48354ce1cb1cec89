//! Wire protocol between collaboration clients and the room server.
//!
//! Every message is one JSON text frame with a `type` tag:
//!
//! ```text
//! client → server                     server → client
//! ─────────────────────────────       ───────────────────────────────────────────
//! join          { name }              full-state         { elements, participants }
//! scene-update  { elements }          scene-update       { elements, from }
//! cursor-update { pointer }           cursor-update      { pointer, name, color }
//! request-state { }                   participant-joined { name, color }
//!                                     participant-left   { name }
//! ```
//!
//! Both directions are closed sum types so dispatch is one exhaustive
//! `match`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::ElementSet;
use crate::presence::Pointer;

/// A participant's public identity, as shared with other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub name: String,
    pub color: String,
}

impl ParticipantSummary {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Announce a display name and enter the room.
    Join { name: String },
    /// Elements changed since the last acknowledged send.
    SceneUpdate { elements: ElementSet },
    /// Local pointer moved.
    CursorUpdate { pointer: Pointer },
    /// Ask for a fresh full-state snapshot.
    RequestState,
}

/// Messages sent by the room server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Entire element set plus everyone in the room.
    FullState {
        elements: ElementSet,
        participants: Vec<ParticipantSummary>,
    },
    /// Another participant's diff, relayed as received.
    SceneUpdate { elements: ElementSet, from: String },
    /// Another participant's pointer.
    CursorUpdate {
        pointer: Pointer,
        name: String,
        color: String,
    },
    ParticipantJoined { name: String, color: String },
    ParticipantLeft { name: String },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::SceneUpdate { .. } => "scene-update",
            ClientMessage::CursorUpdate { .. } => "cursor-update",
            ClientMessage::RequestState => "request-state",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::FullState { .. } => "full-state",
            ServerMessage::SceneUpdate { .. } => "scene-update",
            ServerMessage::CursorUpdate { .. } => "cursor-update",
            ServerMessage::ParticipantJoined { .. } => "participant-joined",
            ServerMessage::ParticipantLeft { .. } => "participant-left",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let msg = ClientMessage::Join { name: "Alice".into() };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "join", "name": "Alice"}));
    }

    #[test]
    fn test_request_state_accepts_empty_body() {
        let msg = ClientMessage::decode(r#"{"type":"request-state"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RequestState);
    }

    #[test]
    fn test_scene_update_decode() {
        let raw = r#"{"type":"scene-update","elements":[
            {"id":"x","version":2,"versionNonce":11,"type":"rectangle","width":40}
        ]}"#;
        match ClientMessage::decode(raw).unwrap() {
            ClientMessage::SceneUpdate { elements } => {
                let x = elements.get("x").unwrap();
                assert_eq!(x.version, 2);
                assert_eq!(x.field("type"), Some(&json!("rectangle")));
                assert_eq!(x.field("width"), Some(&json!(40)));
            }
            other => panic!("expected scene-update, got {other:?}"),
        }
    }

    #[test]
    fn test_cursor_update_decode() {
        let raw = r#"{"type":"cursor-update","pointer":{"x":10.5,"y":-3}}"#;
        let msg = ClientMessage::decode(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CursorUpdate {
                pointer: Pointer::new(10.5, -3.0)
            }
        );
    }

    #[test]
    fn test_full_state_wire_shape() {
        let msg = ServerMessage::FullState {
            elements: ElementSet::from_elements([Element::with_version("a", 1, 2)]),
            participants: vec![ParticipantSummary::new("Bob", "#1971c2")],
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "full-state");
        assert_eq!(value["elements"][0]["versionNonce"], 2);
        assert_eq!(value["participants"][0], json!({"name": "Bob", "color": "#1971c2"}));
    }

    #[test]
    fn test_server_scene_update_carries_origin() {
        let msg = ServerMessage::SceneUpdate {
            elements: ElementSet::from_elements([Element::with_version("x", 3, 1)]),
            from: "A".into(),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "scene-update");
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(ClientMessage::decode(r#"{"type":"join"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"cursor-update"}"#).is_err());
        assert!(ClientMessage::decode(r#"{"type":"scene-update","elements":[{"id":"x"}]}"#).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ClientMessage::decode(r#"{"type":"delete-everything"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ClientMessage::decode("not json").is_err());
        assert!(ServerMessage::decode("{").is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ClientMessage::RequestState.kind(), "request-state");
        assert_eq!(
            ServerMessage::ParticipantLeft { name: "x".into() }.kind(),
            "participant-left"
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtocolError::Serialization("cycle".into()).to_string(),
            "Serialization error: cycle"
        );
        assert_eq!(
            ProtocolError::Deserialization("bad".into()).to_string(),
            "Deserialization error: bad"
        );
    }
}
