//! Explicitly constructed client context.
//!
//! ARCHITECTURE
//! ============
//! `SyncContext` builds and owns one of each component and wires them
//! together. Nothing is global: two contexts in one process share no state,
//! which is what the tests rely on.
//!
//! ```text
//!   EventBus ◀──────────── SessionManager ◀── Api ◀── ChatSession
//!      ▲  ▲                      │ token
//!      │  └── ConnectionManager ◀┘
//!      │            ▲
//!      └────── TopicRegistry
//! ```
//!
//! LIFECYCLE
//! =========
//! `new` only constructs. `init` restores stored credentials, attaches the
//! registry to `Connected`, routes `SessionInvalidated` to a disconnect, and
//! connects when a credential exists. `dispose` disconnects and removes every
//! listener the context registered.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::api::Api;
use crate::chat::ChatSession;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Connector, WsConnector};
use crate::error::ClientError;
use crate::events::{EventBus, EventKind, Listener};
use crate::registry::TopicRegistry;
use crate::session::SessionManager;
use crate::store::{CredentialStore, FileStore, MemoryStore};
use crate::types::User;

pub struct SyncContext {
    config: ClientConfig,
    bus: Arc<EventBus>,
    session: Arc<SessionManager>,
    api: Api,
    connection: Arc<ConnectionManager>,
    registry: Arc<TopicRegistry>,
    wired: Mutex<Vec<(EventKind, Listener)>>,
}

impl SyncContext {
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ClientError> {
        let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
        Self::with_connector(config, store, connector)
    }

    /// Like [`SyncContext::new`] with a custom push-channel connector.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn with_connector(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let bus = Arc::new(EventBus::new());
        let session = Arc::new(SessionManager::new(&config, Arc::clone(&bus), store)?);
        let connection =
            ConnectionManager::new(connector, Arc::clone(&bus), config.reconnect, config.handshake_timeout);
        let registry = TopicRegistry::new(Arc::clone(&connection), Arc::clone(&bus));
        Ok(Self {
            api: Api::new(Arc::clone(&session)),
            config,
            bus,
            session,
            connection,
            registry,
            wired: Mutex::new(Vec::new()),
        })
    }

    /// Context from `DOCSYNC_*` variables. Credentials persist to
    /// `DOCSYNC_CREDENTIALS_PATH` when set, otherwise only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, ClientError> {
        let config = ClientConfig::from_env();
        let store: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, store)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Restore credentials and start the push channel if one was stored.
    /// Returns whether a credential was restored. Calling twice re-wires
    /// nothing.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if persisted credentials are unreadable.
    pub fn init(&self) -> Result<bool, ClientError> {
        let restored = self.session.restore()?;
        {
            let mut wired = self.lock_wired();
            if wired.is_empty() {
                self.registry.attach();
                let connection = Arc::downgrade(&self.connection);
                let on_invalidated = self.bus.on(EventKind::SessionInvalidated, move |_| {
                    if let Some(connection) = connection.upgrade() {
                        connection.disconnect();
                    }
                });
                wired.push((EventKind::SessionInvalidated, on_invalidated));
            }
        }
        if let Some(token) = self.session.token() {
            self.connection.connect(&token);
        }
        info!(restored, "sync context initialised");
        Ok(restored)
    }

    /// Disconnect and remove every listener this context registered.
    pub fn dispose(&self) {
        self.connection.disconnect();
        self.registry.detach();
        let wired = std::mem::take(&mut *self.lock_wired());
        for (kind, listener) in wired {
            self.bus.off(kind, &listener);
        }
        info!("sync context disposed");
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates the login request failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ClientError> {
        let resp = self.api.login(email, password).await?;
        self.connection.connect(&resp.access_token);
        Ok(resp.user)
    }

    /// # Errors
    ///
    /// Propagates the registration request failure.
    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<User, ClientError> {
        let resp = self.api.register(email, password, name).await?;
        self.connection.connect(&resp.access_token);
        Ok(resp.user)
    }

    /// Adopt an externally obtained token and (re)connect with it.
    pub fn use_token(&self, token: &str) {
        self.session.set_credential(token);
        self.connection.connect(token);
    }

    /// Clear the session as one unit and close the push channel.
    pub fn logout(&self) {
        self.session.clear_credential();
        self.connection.disconnect();
        info!("logged out");
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Open a conversation view bound to this context's room registry.
    #[must_use]
    pub fn open_chat(&self, chat_id: &str) -> ChatSession {
        ChatSession::open(chat_id, self.api.clone(), Arc::clone(&self.registry), Arc::clone(&self.bus))
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    #[must_use]
    pub fn api(&self) -> &Api {
        &self.api
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    fn lock_wired(&self) -> MutexGuard<'_, Vec<(EventKind, Listener)>> {
        self.wired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
