//! Typed endpoints over the session's generic `request`.
//!
//! Each call is a thin shim: build the path and body, delegate to
//! `SessionManager`, decode. Auth calls additionally update the session.
//! Reporting endpoints return raw JSON since their shape is view-specific.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Value, json};

use crate::error::ClientError;
use crate::session::{RequestOptions, SessionManager};
use crate::types::{
    AuthResponse, Chat, ChatEnvelope, ChatList, Document, DocumentList, ProfileResponse, SendMessageResponse, User,
};

fn document_path(document_id: &str) -> String {
    format!("/documents/{document_id}")
}

fn document_tag_path(document_id: &str, tag: &str) -> String {
    format!("/documents/{document_id}/tags/{tag}")
}

fn chat_path(chat_id: &str) -> String {
    format!("/chat/{chat_id}")
}

pub(crate) fn chat_messages_path(chat_id: &str) -> String {
    format!("/chat/{chat_id}/messages")
}

fn paging(skip: u32, limit: u32) -> RequestOptions {
    RequestOptions::default()
        .with_query("skip", skip)
        .with_query("limit", limit)
}

#[derive(Clone)]
pub struct Api {
    session: Arc<SessionManager>,
}

impl Api {
    #[must_use]
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    // -------------------------------------------------------------------------
    // Auth
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates request failures; on success the session is stored.
    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse, ClientError> {
        let body = json!({ "email": email, "password": password, "name": name });
        let resp: AuthResponse = self
            .session
            .request_as(Method::POST, "/auth/register", Some(&body), RequestOptions::default())
            .await?;
        self.store_auth(&resp);
        Ok(resp)
    }

    /// # Errors
    ///
    /// Propagates request failures; on success the session is stored.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ClientError> {
        let body = json!({ "email": email, "password": password });
        let resp: AuthResponse = self
            .session
            .request_as(Method::POST, "/auth/login", Some(&body), RequestOptions::default())
            .await?;
        self.store_auth(&resp);
        Ok(resp)
    }

    /// Fetch the profile and refresh the cached copy.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn profile(&self) -> Result<User, ClientError> {
        let resp: ProfileResponse = self
            .session
            .request_as(Method::GET, "/auth/profile", None, RequestOptions::default())
            .await?;
        self.session.set_profile(resp.user.clone());
        Ok(resp.user)
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn update_profile(&self, changes: &Value) -> Result<User, ClientError> {
        let resp: ProfileResponse = self
            .session
            .request_as(Method::PUT, "/auth/profile", Some(changes), RequestOptions::default())
            .await?;
        self.session.set_profile(resp.user.clone());
        Ok(resp.user)
    }

    /// # Errors
    ///
    /// See [`SessionManager::refresh`].
    pub async fn refresh(&self) -> Result<String, ClientError> {
        self.session.refresh().await
    }

    fn store_auth(&self, resp: &AuthResponse) {
        self.session
            .set_session(resp.access_token.clone(), resp.refresh_token.clone(), Some(resp.user.clone()));
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn upload_document(&self, filename: &str, bytes: Vec<u8>) -> Result<Value, ClientError> {
        self.session.upload("/documents/upload", filename, bytes).await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn list_documents(&self, skip: u32, limit: u32) -> Result<DocumentList, ClientError> {
        self.session
            .request_as(Method::GET, "/documents/", None, paging(skip, limit))
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn get_document(&self, document_id: &str) -> Result<Document, ClientError> {
        let value = self
            .session
            .request(Method::GET, &document_path(document_id), None, RequestOptions::default())
            .await?;
        // Older servers wrap the document in {"document": ...}.
        let doc = value.get("document").cloned().unwrap_or(value);
        serde_json::from_value(doc).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn delete_document(&self, document_id: &str) -> Result<Value, ClientError> {
        self.session
            .request(Method::DELETE, &document_path(document_id), None, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn search_documents(
        &self,
        query: &str,
        document_id: Option<&str>,
        limit: u32,
    ) -> Result<Value, ClientError> {
        let body = json!({ "query": query, "document_id": document_id, "limit": limit });
        self.session
            .request(Method::POST, "/documents/search", Some(&body), RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn add_tag(&self, document_id: &str, tag: &str) -> Result<Value, ClientError> {
        let body = json!({ "tag": tag });
        let path = format!("{}/tags", document_path(document_id));
        self.session
            .request(Method::POST, &path, Some(&body), RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn remove_tag(&self, document_id: &str, tag: &str) -> Result<Value, ClientError> {
        self.session
            .request(Method::DELETE, &document_tag_path(document_id, tag), None, RequestOptions::default())
            .await
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn create_chat(&self, document_id: Option<&str>, title: &str) -> Result<Chat, ClientError> {
        let body = json!({ "document_id": document_id, "title": title });
        let resp: ChatEnvelope = self
            .session
            .request_as(Method::POST, "/chat/", Some(&body), RequestOptions::default())
            .await?;
        Ok(resp.chat)
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn list_chats(&self, skip: u32, limit: u32) -> Result<ChatList, ClientError> {
        self.session
            .request_as(Method::GET, "/chat/", None, paging(skip, limit))
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn get_chat(&self, chat_id: &str) -> Result<Chat, ClientError> {
        let resp: ChatEnvelope = self
            .session
            .request_as(Method::GET, &chat_path(chat_id), None, RequestOptions::default())
            .await?;
        Ok(resp.chat)
    }

    /// Post a user message. `client_id` is echoed back by servers that
    /// support correlation with a pending optimistic entry.
    ///
    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn send_message(
        &self,
        chat_id: &str,
        message: &str,
        client_id: Option<&str>,
    ) -> Result<SendMessageResponse, ClientError> {
        let mut body = json!({ "message": message });
        if let Some(client_id) = client_id {
            body["client_id"] = json!(client_id);
        }
        self.session
            .request_as(Method::POST, &chat_messages_path(chat_id), Some(&body), RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn update_chat(&self, chat_id: &str, title: &str) -> Result<Value, ClientError> {
        let body = json!({ "title": title });
        self.session
            .request(Method::PUT, &chat_path(chat_id), Some(&body), RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<Value, ClientError> {
        self.session
            .request(Method::DELETE, &chat_path(chat_id), None, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn clear_chat(&self, chat_id: &str) -> Result<Value, ClientError> {
        let path = format!("{}/clear", chat_path(chat_id));
        self.session
            .request(Method::POST, &path, None, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn ask_question(&self, question: &str, document_id: Option<&str>) -> Result<Value, ClientError> {
        let body = json!({ "question": question, "document_id": document_id });
        self.session
            .request(Method::POST, "/chat/ask", Some(&body), RequestOptions::default())
            .await
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn dashboard(&self) -> Result<Value, ClientError> {
        self.session
            .request(Method::GET, "/analytics/dashboard", None, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn document_stats(&self, days: u32) -> Result<Value, ClientError> {
        self.session
            .request(
                Method::GET,
                "/analytics/documents/stats",
                None,
                RequestOptions::default().with_query("days", days),
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn search_trends(&self, days: u32) -> Result<Value, ClientError> {
        self.session
            .request(
                Method::GET,
                "/analytics/search/trends",
                None,
                RequestOptions::default().with_query("days", days),
            )
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn performance(&self) -> Result<Value, ClientError> {
        self.session
            .request(Method::GET, "/analytics/performance", None, RequestOptions::default())
            .await
    }

    /// # Errors
    ///
    /// Propagates request failures.
    pub async fn export(&self, kind: &str, format: &str) -> Result<Value, ClientError> {
        let body = json!({ "type": kind, "format": format });
        self.session
            .request(Method::POST, "/analytics/export", Some(&body), RequestOptions::default())
            .await
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
