//! Event multiplexer: typed in-process publish/subscribe.
//!
//! DESIGN
//! ======
//! Events are a closed enum; listeners register against an `EventKind`
//! discriminant and are matched by exact equality only. Each kind keeps an
//! ordered list of listeners and `emit` invokes them synchronously in
//! registration order.
//!
//! Listeners are isolated from one another: a panicking listener is caught,
//! logged, and skipped. The emitter never sees the panic.
//!
//! The listener table is snapshotted before dispatch, so listeners may call
//! `on`/`off`/`emit` re-entrantly without deadlocking. A listener added during
//! an emit first runs on the next emit.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::types::ChatMessage;

// =============================================================================
// PAYLOADS
// =============================================================================

/// Payload of the three `document_processing_*` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentProcessing {
    pub document_id: String,
    #[serde(default)]
    pub document_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub document_id: String,
    #[serde(default)]
    pub update_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageNotice {
    pub chat_id: String,
    pub message: ChatMessage,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    #[serde(default)]
    pub alert_type: Option<String>,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMaintenance {
    pub message: String,
    #[serde(default)]
    pub scheduled_time: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// =============================================================================
// EVENTS
// =============================================================================

/// Discriminant used as the subscription key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ConnectionError,
    Reconnecting,
    MaxReconnectAttempts,
    SessionInvalidated,
    DocumentProcessingStarted,
    DocumentProcessingCompleted,
    DocumentProcessingFailed,
    DocumentUpdated,
    NewChatMessage,
    SystemAlert,
    SystemMaintenance,
    ServerError,
    RoomAck,
}

impl EventKind {
    /// Stable snake_case name, matching the push-channel frame name where one
    /// exists.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ConnectionError => "connection_error",
            Self::Reconnecting => "reconnecting",
            Self::MaxReconnectAttempts => "max_reconnect_attempts",
            Self::SessionInvalidated => "session_invalidated",
            Self::DocumentProcessingStarted => "document_processing_started",
            Self::DocumentProcessingCompleted => "document_processing_completed",
            Self::DocumentProcessingFailed => "document_processing_failed",
            Self::DocumentUpdated => "document_updated",
            Self::NewChatMessage => "new_chat_message",
            Self::SystemAlert => "system_alert",
            Self::SystemMaintenance => "system_maintenance",
            Self::ServerError => "error",
            Self::RoomAck => "room_ack",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Handshake accepted; the push channel is live.
    Connected,
    /// The live channel dropped without an explicit disconnect.
    Disconnected { reason: String },
    /// A handshake attempt failed or timed out.
    ConnectionError { error: String },
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Backoff exhausted; a new explicit `connect` is required.
    MaxReconnectAttempts { attempts: u32 },
    /// The credential was rejected and has been cleared.
    SessionInvalidated,
    DocumentProcessingStarted(DocumentProcessing),
    DocumentProcessingCompleted(DocumentProcessing),
    DocumentProcessingFailed(DocumentProcessing),
    DocumentUpdated(DocumentUpdate),
    NewChatMessage(ChatMessageNotice),
    SystemAlert(SystemAlert),
    SystemMaintenance(SystemMaintenance),
    /// Server-originated `error` frame outside the handshake.
    ServerError { message: String },
    /// Acknowledgement of a join/leave (`joined_room`, `left_chat_room`, ...).
    RoomAck { event: String, room: String },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::MaxReconnectAttempts { .. } => EventKind::MaxReconnectAttempts,
            Self::SessionInvalidated => EventKind::SessionInvalidated,
            Self::DocumentProcessingStarted(_) => EventKind::DocumentProcessingStarted,
            Self::DocumentProcessingCompleted(_) => EventKind::DocumentProcessingCompleted,
            Self::DocumentProcessingFailed(_) => EventKind::DocumentProcessingFailed,
            Self::DocumentUpdated(_) => EventKind::DocumentUpdated,
            Self::NewChatMessage(_) => EventKind::NewChatMessage,
            Self::SystemAlert(_) => EventKind::SystemAlert,
            Self::SystemMaintenance(_) => EventKind::SystemMaintenance,
            Self::ServerError { .. } => EventKind::ServerError,
            Self::RoomAck { .. } => EventKind::RoomAck,
        }
    }
}

// =============================================================================
// BUS
// =============================================================================

/// A registered callback. Held by `Arc` so `off` can match by identity.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure and return its handle for a later `off`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Listener
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(callback);
        self.add(kind, Arc::clone(&listener));
        listener
    }

    /// Append an existing handle. The same handle may be registered twice and
    /// then runs twice per emit.
    pub fn add(&self, kind: EventKind, listener: Listener) {
        self.lock().entry(kind).or_default().push(listener);
    }

    /// Remove the first registration of `listener` for `kind`.
    ///
    /// Returns `false` if it was not registered.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut table = self.lock();
        let Some(list) = table.get_mut(&kind) else {
            return false;
        };
        let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            table.remove(&kind);
        }
        true
    }

    /// Invoke every listener for the event's kind, in registration order.
    ///
    /// Returns how many listeners ran to completion.
    pub fn emit(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self.lock().get(&kind).cloned().unwrap_or_default();

        let mut completed = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    error!(event = %kind, panic = panic_message(panic.as_ref()), "event listener panicked");
                }
            }
        }
        completed
    }

    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
