//! # Session Wire Protocol
//!
//! Every frame on the room WebSocket is a JSON text message tagged with a `type` field.
//! Both sides decode exactly once at the transport boundary into the closed enums below,
//! so nothing past the socket ever looks at untyped JSON.
//!
//! ## Client → Server
//! `join`, `leave`, `voice`, `voiceStart`, `voiceEnd`, `whiteboardImage`, `chatMessage`
//!
//! ## Server → Client
//! `joined`, `chatHistory`, `participantJoined`, `participantLeft`, `voice`,
//! `participantVoiceStart`, `participantVoiceEnd`, `whiteboardUpdate`, `chatMessage`, `error`
//!
//! ## Ordering
//! Voice frames carry no sequence number or timestamp. Ordering is whatever order the
//! transport delivers them in; out-of-order frames cannot be detected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned identifier of one live connection (a UUID v4 string).
pub type ConnectionId = String;

/// Room namespace key.
pub type RoomId = String;

/// Public view of a room member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    /// Client supplied, not unique
    pub display_name: String,
    pub is_speaking: bool,
    pub joined_at: DateTime<Utc>,
}

/// One entry of a room's chat log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_display_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Last-write-wins whiteboard value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardState {
    /// Opaque encoded image blob or URL
    pub image_reference: String,
    pub updated_by: ConnectionId,
    pub updated_at: DateTime<Utc>,
}

/// Messages a client sends to the room server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join handshake. `room` falls back to the server's default room.
    Join {
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },
    /// Explicit leave (a dropped socket is an implicit one)
    Leave,
    /// Base64 little-endian PCM16 frame
    Voice { payload: String },
    VoiceStart,
    VoiceEnd,
    WhiteboardImage { image_reference: String },
    ChatMessage { text: String },
}

impl ClientMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Voice { .. } => "voice",
            ClientMessage::VoiceStart => "voiceStart",
            ClientMessage::VoiceEnd => "voiceEnd",
            ClientMessage::WhiteboardImage { .. } => "whiteboardImage",
            ClientMessage::ChatMessage { .. } => "chatMessage",
        }
    }
}

/// Events the room server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Reply to `join`: membership snapshot (including the caller) and the current whiteboard.
    Joined {
        connection_id: ConnectionId,
        room: RoomId,
        participants: Vec<ParticipantInfo>,
        whiteboard: Option<WhiteboardState>,
    },
    /// Full chat log replay, delivered once right after `joined`.
    ChatHistory { messages: Vec<ChatMessage> },
    ParticipantJoined { participant: ParticipantInfo },
    ParticipantLeft { connection_id: ConnectionId },
    Voice {
        sender_connection_id: ConnectionId,
        payload: String,
    },
    ParticipantVoiceStart { connection_id: ConnectionId },
    ParticipantVoiceEnd { connection_id: ConnectionId },
    WhiteboardUpdate(WhiteboardState),
    ChatMessage(ChatMessage),
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::ChatHistory { .. } => "chatHistory",
            ServerEvent::ParticipantJoined { .. } => "participantJoined",
            ServerEvent::ParticipantLeft { .. } => "participantLeft",
            ServerEvent::Voice { .. } => "voice",
            ServerEvent::ParticipantVoiceStart { .. } => "participantVoiceStart",
            ServerEvent::ParticipantVoiceEnd { .. } => "participantVoiceEnd",
            ServerEvent::WhiteboardUpdate(_) => "whiteboardUpdate",
            ServerEvent::ChatMessage(_) => "chatMessage",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_join_accepts_camel_case_and_optional_room() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join","displayName":"Alice"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                display_name: "Alice".to_string(),
                room: None
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join","displayName":"Bob","room":"physics"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Join { room: Some(r), .. } if r == "physics"));
    }

    #[test]
    fn test_unit_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"voiceStart"}"#).unwrap();
        assert_eq!(msg, ClientMessage::VoiceStart);
        assert_eq!(
            serde_json::to_value(ClientMessage::Leave).unwrap(),
            json!({"type": "leave"})
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"explode"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"text":"no tag"}"#).is_err());
    }

    #[test]
    fn test_whiteboard_update_is_flat() {
        let event = ServerEvent::WhiteboardUpdate(WhiteboardState {
            image_reference: "data:image/png;base64,AAAA".to_string(),
            updated_by: "c1".to_string(),
            updated_at: Utc::now(),
        });
        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "whiteboardUpdate");
        assert_eq!(value["imageReference"], "data:image/png;base64,AAAA");
        assert_eq!(value["updatedBy"], "c1");

        let back: ServerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_voice_event_field_names() {
        let event = ServerEvent::Voice {
            sender_connection_id: "abc".to_string(),
            payload: "AAA=".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "voice", "senderConnectionId": "abc", "payload": "AAA="})
        );
    }
}
