//! WebSocket protocol message types.
//!
//! Defines the JSON frames exchanged between producers, dashboards and the
//! gateway. Every frame carries a `type` discriminator.

use crate::error::{Error, Result};
use crate::update::{CallUpdate, Speaker};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from a producer or dashboard to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a logical call stream; the sender is subscribed to it.
    CallStart {
        call_id: String,
        customer_id: String,
    },
    /// Raw utterance payload. `audio_data` may be base64, hex or plain text.
    AudioChunk {
        call_id: String,
        audio_data: String,
        speaker: Speaker,
    },
    /// Receive updates for a call.
    SubscribeCall { call_id: String },
    /// Stop receiving updates for a call.
    UnsubscribeCall { call_id: String },
    /// The agent picked one of the ranked responses.
    AgentResponseSelected {
        call_id: String,
        response_id: String,
    },
    /// Close a logical call stream.
    CallEnd {
        call_id: String,
        /// Opaque outcome record forwarded to the processor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<serde_json::Value>,
    },
    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let msg: ClientMessage = serde_json::from_str(text)
            .map_err(|e| Error::InvalidMessage(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    /// The call this message refers to, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ClientMessage::CallStart { call_id, .. }
            | ClientMessage::AudioChunk { call_id, .. }
            | ClientMessage::SubscribeCall { call_id }
            | ClientMessage::UnsubscribeCall { call_id }
            | ClientMessage::AgentResponseSelected { call_id, .. }
            | ClientMessage::CallEnd { call_id, .. } => Some(call_id),
            ClientMessage::Ping => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(call_id) = self.call_id() {
            if call_id.is_empty() {
                return Err(Error::InvalidMessage("call_id must not be empty".to_string()));
            }
        }
        match self {
            ClientMessage::CallStart { customer_id, .. } if customer_id.is_empty() => Err(
                Error::InvalidMessage("customer_id must not be empty".to_string()),
            ),
            ClientMessage::AgentResponseSelected { response_id, .. } if response_id.is_empty() => {
                Err(Error::InvalidMessage("response_id must not be empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from the gateway to connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Processing snapshot for a call. Same frame for scoped and global connections.
    CallUpdate(CallUpdate),
    /// A call stream was opened.
    CallStarted {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        customer_id: Option<String>,
    },
    /// A call stream was closed.
    CallEnded { call_id: String },
    /// Confirmation of subscription.
    Subscribed { call_id: String },
    /// Confirmation of unsubscription.
    Unsubscribed { call_id: String },
    /// Pong response to ping.
    Pong,
    /// Error message.
    Error {
        /// Error message.
        message: String,
        /// Error code.
        code: String,
    },
}

impl ServerMessage {
    /// The call this frame is about, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            ServerMessage::CallUpdate(update) => Some(&update.call_id),
            ServerMessage::CallStarted { call_id, .. }
            | ServerMessage::CallEnded { call_id }
            | ServerMessage::Subscribed { call_id }
            | ServerMessage::Unsubscribed { call_id } => Some(call_id),
            ServerMessage::Pong | ServerMessage::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::CallStatus;

    #[test]
    fn test_parse_control_messages() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe_call","call_id":"c1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubscribeCall {
                call_id: "c1".to_string()
            }
        );

        let msg = ClientMessage::parse(
            r#"{"type":"audio_chunk","call_id":"c1","audio_data":"SGVsbG8=","speaker":"agent"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::AudioChunk {
                speaker: Speaker::Agent,
                ..
            }
        ));

        let msg = ClientMessage::parse(r#"{"type":"call_end","call_id":"c1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::CallEnd {
                call_id: "c1".to_string(),
                outcome: None
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // Unknown type.
        assert!(ClientMessage::parse(r#"{"type":"explode","call_id":"c1"}"#).is_err());
        // Missing required field.
        assert!(ClientMessage::parse(r#"{"type":"call_start","call_id":"c1"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"audio_chunk","call_id":"c1","audio_data":"x"}"#).is_err());
        // Empty call id.
        assert!(ClientMessage::parse(r#"{"type":"subscribe_call","call_id":""}"#).is_err());
        // Not JSON.
        assert!(ClientMessage::parse("subscribe me").is_err());
    }

    #[test]
    fn test_call_update_frame_is_flat() {
        let update = CallUpdate::new("c1", CallStatus::Pending);
        let json = serde_json::to_value(ServerMessage::CallUpdate(update.clone())).unwrap();
        assert_eq!(json["type"], "call_update");
        assert_eq!(json["call_id"], "c1");
        assert_eq!(json["status"], "pending");

        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, ServerMessage::CallUpdate(update));
    }

    #[test]
    fn test_error_frame() {
        let msg = ServerMessage::Error {
            message: "bad".to_string(),
            code: "INVALID_MESSAGE".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "INVALID_MESSAGE");
        assert!(msg.call_id().is_none());
    }
}
