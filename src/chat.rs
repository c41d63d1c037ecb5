//! Conversation view state: the send-message flow over a `Reconciler`.
//!
//! A `ChatSession` holds one conversation's message list. `send` shows the
//! user's text immediately as a pending entry, posts it, and swaps in the
//! server's messages (the user message plus any generated reply) in one
//! update. Messages pushed on the conversation's room are merged as they
//! arrive. The room is joined for as long as the session is open.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::Api;
use crate::error::ClientError;
use crate::events::{Event, EventBus, EventKind, Listener};
use crate::frame::chat_topic;
use crate::reconciler::{Canonical, ListEntry, Reconciler, TempId};
use crate::registry::TopicRegistry;
use crate::types::{Chat, ChatMessage};

pub type MessageList = Reconciler<String, ChatMessage>;
pub type MessageEntry = ListEntry<String, ChatMessage>;

impl Canonical for ChatMessage {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn correlation_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

pub struct ChatSession {
    chat_id: String,
    topic: String,
    api: Api,
    registry: Arc<TopicRegistry>,
    bus: Arc<EventBus>,
    messages: Arc<MessageList>,
    listener: Mutex<Option<Listener>>,
}

impl ChatSession {
    /// Start tracking `chat_id`: join its room and merge pushed messages.
    #[must_use]
    pub fn open(chat_id: impl Into<String>, api: Api, registry: Arc<TopicRegistry>, bus: Arc<EventBus>) -> Self {
        let chat_id = chat_id.into();
        let topic = chat_topic(&chat_id);
        let messages: Arc<MessageList> = Arc::new(Reconciler::new());

        let listener = {
            let messages = Arc::clone(&messages);
            let chat_id = chat_id.clone();
            bus.on(EventKind::NewChatMessage, move |event| {
                if let Event::NewChatMessage(notice) = event {
                    if notice.chat_id == chat_id {
                        messages.apply_push(notice.message.clone());
                    }
                }
            })
        };
        registry.join(&topic);
        info!(%chat_id, "chat session opened");

        Self {
            chat_id,
            topic,
            api,
            registry,
            bus,
            messages,
            listener: Mutex::new(Some(listener)),
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Fetch the conversation and replace the local history with it.
    ///
    /// # Errors
    ///
    /// Propagates request failures; the local list is left unchanged.
    pub async fn load(&self) -> Result<Chat, ClientError> {
        let chat = self.api.get_chat(&self.chat_id).await?;
        self.messages.replace_all(chat.messages.clone());
        Ok(chat)
    }

    /// Send `text` optimistically and reconcile with the server's answer.
    ///
    /// Returns the list after reconciliation.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Busy`] while a previous send is unresolved.
    /// - Request failures, after the pending entry has been rolled back.
    ///
    /// Dropping the returned future before it completes rolls the pending
    /// entry back, so a cancelled send never leaves the list busy.
    pub async fn send(&self, text: &str) -> Result<Vec<MessageEntry>, ClientError> {
        let (temp_id, _) = self.messages.submit(text.to_owned())?;
        let pending = PendingSend { messages: &self.messages, chat_id: &self.chat_id, temp_id: Some(temp_id) };
        match self.api.send_message(&self.chat_id, text, pending.temp_id()).await {
            Ok(resp) => Ok(pending.confirm(resp.messages)),
            Err(err) => {
                warn!(chat_id = %self.chat_id, error = %err, "send failed; rolling back");
                pending.fail();
                Err(err)
            }
        }
    }

    /// Clear the conversation on the server, then empty the local list.
    ///
    /// # Errors
    ///
    /// Propagates request failures; the local list is left unchanged.
    pub async fn clear(&self) -> Result<(), ClientError> {
        self.api.clear_chat(&self.chat_id).await?;
        self.messages.replace_all(Vec::new());
        info!(chat_id = %self.chat_id, "chat history cleared");
        Ok(())
    }

    #[must_use]
    pub fn messages(&self) -> Vec<MessageEntry> {
        self.messages.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<MessageEntry>> {
        self.messages.subscribe()
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.messages.is_busy()
    }

    /// Leave the room and stop merging pushes. Idempotent; also run on drop.
    pub fn close(&self) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            self.bus.off(EventKind::NewChatMessage, &listener);
            self.registry.leave(&self.topic);
            info!(chat_id = %self.chat_id, "chat session closed");
        }
    }
}

// =============================================================================
// PENDING SEND
// =============================================================================

/// An unresolved submission. Resolves exactly once: through `confirm`,
/// `fail`, or on drop when the send future is cancelled.
struct PendingSend<'a> {
    messages: &'a MessageList,
    chat_id: &'a str,
    temp_id: Option<TempId>,
}

impl PendingSend<'_> {
    fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_ref().map(TempId::as_str)
    }

    fn confirm(mut self, items: Vec<ChatMessage>) -> Vec<MessageEntry> {
        match self.temp_id.take() {
            Some(temp_id) => self.messages.confirm(&temp_id, items),
            None => self.messages.snapshot(),
        }
    }

    fn fail(mut self) {
        if let Some(temp_id) = self.temp_id.take() {
            self.messages.fail(&temp_id);
        }
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        if let Some(temp_id) = self.temp_id.take() {
            warn!(chat_id = %self.chat_id, %temp_id, "send cancelled; rolling back");
            self.messages.fail(&temp_id);
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
