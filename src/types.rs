//! Wire DTOs for the request/response channel.
//!
//! DESIGN
//! ======
//! These mirror the server's JSON payloads. Optional server fields default
//! so older servers that omit them still decode; open-ended blobs (metadata,
//! reporting snapshots) stay `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authenticated user profile, cached alongside the credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub document_count: Option<u64>,
    #[serde(default)]
    pub total_size: Option<u64>,
}

/// Body returned by `POST /auth/login` and `POST /auth/register`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: User,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub user: User,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    /// `pending`, `processing`, `completed` or `failed`.
    #[serde(default)]
    pub processing_status: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub processed_date: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentList {
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// A single chat message as the server stores it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// `user` or `assistant`.
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Temporary id the sender attached when submitting, echoed back by
    /// servers that support correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub message_count: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    pub chat: Chat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatList {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Body returned by `POST /chat/{id}/messages`: the stored user message plus
/// the generated reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
