//! Push-channel frames: named JSON messages over a WebSocket.
//!
//! ARCHITECTURE
//! ============
//! Every push-channel message is `{"event": <name>, "data": {...}}`. The
//! client sends a `handshake` carrying the credential, then `join_*`/`leave_*`
//! room frames. The server answers the handshake with `connected` or `error`
//! and afterwards pushes named notification frames.
//!
//! DESIGN
//! ======
//! - Decoding is two-step: text → `PushFrame` (shape only), then
//!   `PushFrame` → `Event` (typed payload). Unknown names decode to `None` so
//!   a newer server cannot break an older client.
//! - Topics are plain strings (`chat:123`, `document:abc`). The scope prefix
//!   picks the room frame name and payload key the server expects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::events::Event;

// =============================================================================
// FRAME NAMES
// =============================================================================

pub const HANDSHAKE: &str = "handshake";
pub const CONNECTED: &str = "connected";
pub const ERROR: &str = "error";

/// Topic prefix for document-scoped rooms.
pub const DOCUMENT_SCOPE: &str = "document";
/// Topic prefix for conversation-scoped rooms.
pub const CHAT_SCOPE: &str = "chat";

// =============================================================================
// FRAME
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub event: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Error returned by [`PushFrame::decode`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed push frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl PushFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }

    #[must_use]
    pub fn handshake(token: &str) -> Self {
        Self::new(HANDSHAKE, json!({ "token": token }))
    }

    #[must_use]
    pub fn join(topic: &str) -> Self {
        room_frame(RoomAction::Join, topic)
    }

    #[must_use]
    pub fn leave(topic: &str) -> Self {
        room_frame(RoomAction::Leave, topic)
    }

    /// Encode as WebSocket text.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a String key and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode WebSocket text.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] when the text is not a JSON object
    /// with a string `event`.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// `message` field of the payload, used by `error` frames.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    /// Map a server-originated frame to a typed event.
    ///
    /// Returns `None` for handshake replies, unknown names, and payloads that
    /// do not match the expected shape.
    #[must_use]
    pub fn into_event(self) -> Option<Event> {
        let data = self.data;
        let event = match self.event.as_str() {
            "document_processing_started" => Event::DocumentProcessingStarted(serde_json::from_value(data).ok()?),
            "document_processing_completed" => Event::DocumentProcessingCompleted(serde_json::from_value(data).ok()?),
            "document_processing_failed" => Event::DocumentProcessingFailed(serde_json::from_value(data).ok()?),
            "document_updated" => Event::DocumentUpdated(serde_json::from_value(data).ok()?),
            "new_chat_message" => Event::NewChatMessage(serde_json::from_value(data).ok()?),
            "system_alert" => Event::SystemAlert(serde_json::from_value(data).ok()?),
            "system_maintenance" => Event::SystemMaintenance(serde_json::from_value(data).ok()?),
            ERROR => Event::ServerError {
                message: data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_owned(),
            },
            name @ ("joined_room" | "left_room" | "joined_chat_room" | "left_chat_room") => Event::RoomAck {
                event: name.to_owned(),
                room: ack_room(&data)?,
            },
            _ => return None,
        };
        Some(event)
    }
}

fn ack_room(data: &Value) -> Option<String> {
    if let Some(id) = data.get("document_id").and_then(Value::as_str) {
        return Some(format!("{DOCUMENT_SCOPE}:{id}"));
    }
    if let Some(id) = data.get("chat_id").and_then(Value::as_str) {
        return Some(format!("{CHAT_SCOPE}:{id}"));
    }
    data.get("room").and_then(Value::as_str).map(str::to_owned)
}

// =============================================================================
// ROOMS
// =============================================================================

#[derive(Clone, Copy)]
enum RoomAction {
    Join,
    Leave,
}

impl RoomAction {
    fn verb(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }
}

fn room_frame(action: RoomAction, topic: &str) -> PushFrame {
    let verb = action.verb();
    match topic.split_once(':') {
        Some((DOCUMENT_SCOPE, id)) if !id.is_empty() => {
            PushFrame::new(format!("{verb}_document_room"), json!({ "document_id": id }))
        }
        Some((CHAT_SCOPE, id)) if !id.is_empty() => {
            PushFrame::new(format!("{verb}_chat_room"), json!({ "chat_id": id }))
        }
        _ => PushFrame::new(format!("{verb}_room"), json!({ "room": topic })),
    }
}

/// Topic string for a document-scoped room.
#[must_use]
pub fn document_topic(document_id: &str) -> String {
    format!("{DOCUMENT_SCOPE}:{document_id}")
}

/// Topic string for a conversation-scoped room.
#[must_use]
pub fn chat_topic(chat_id: &str) -> String {
    format!("{CHAT_SCOPE}:{chat_id}")
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
