//! Transport session manager: request/response calls with credentials.
//!
//! ARCHITECTURE
//! ============
//! The session owns the credential (access token, refresh token, cached
//! profile) and is the only component that mutates it. Every request carries
//! the current access token as a bearer header when one is present.
//!
//! Responses are classified once here into `ClientError` kinds. No retries
//! happen inside `request`; retry policy belongs to the caller.
//!
//! SESSION INVALIDATION
//! ====================
//! Each credential change bumps an epoch. A request captures the epoch when
//! it starts; on an auth rejection it may only invalidate the session if the
//! epoch is still the one it started with. The first rejected request clears
//! the credential and bumps the epoch, so every other in-flight request that
//! fails the same way finds a stale epoch and does nothing. Exactly one
//! `SessionInvalidated` is emitted per credential.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{Event, EventBus};
use crate::store::{CredentialStore, StoredSession};
use crate::types::{RefreshResponse, User};

const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// OPTIONS
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout for this call.
    pub timeout: Option<Duration>,
    /// Query-string pairs appended to the URL.
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Default)]
struct SessionState {
    token: Option<String>,
    refresh_token: Option<String>,
    profile: Option<User>,
    epoch: u64,
}

impl SessionState {
    fn stored(&self) -> StoredSession {
        StoredSession {
            access_token: self.token.clone(),
            refresh_token: self.refresh_token.clone(),
            user: self.profile.clone(),
        }
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

pub struct SessionManager {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    bus: Arc<EventBus>,
    store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, bus: Arc<EventBus>, store: Arc<dyn CredentialStore>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            timeout: config.request_timeout,
            bus,
            store,
            state: Mutex::new(SessionState::default()),
        })
    }

    // -------------------------------------------------------------------------
    // Credential lifecycle
    // -------------------------------------------------------------------------

    /// Load persisted credentials. Returns `true` if an access token was found.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the store cannot be read.
    pub fn restore(&self) -> Result<bool, ClientError> {
        let stored = self.store.load()?;
        let mut state = self.lock();
        state.token = stored.access_token;
        state.refresh_token = stored.refresh_token;
        state.profile = stored.user;
        state.epoch += 1;
        Ok(state.token.is_some())
    }

    /// Attach `token` to every subsequent request.
    pub fn set_credential(&self, token: impl Into<String>) {
        let mut state = self.lock();
        state.token = Some(token.into());
        state.epoch += 1;
        self.persist(&state);
    }

    /// Replace the whole session after login or registration.
    pub fn set_session(&self, token: impl Into<String>, refresh_token: Option<String>, profile: Option<User>) {
        let mut state = self.lock();
        state.token = Some(token.into());
        state.refresh_token = refresh_token;
        state.profile = profile;
        state.epoch += 1;
        self.persist(&state);
    }

    pub fn set_profile(&self, profile: User) {
        let mut state = self.lock();
        state.profile = Some(profile);
        self.persist(&state);
    }

    /// Drop the credential, refresh token and profile as one unit. Idempotent.
    ///
    /// Does not emit `SessionInvalidated`; that is reserved for rejections.
    pub fn clear_credential(&self) {
        let mut state = self.lock();
        let had_token = state.token.is_some();
        state.token = None;
        state.refresh_token = None;
        state.profile = None;
        state.epoch += 1;
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "credential store clear failed");
        }
        if had_token {
            info!("session credential cleared");
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    #[must_use]
    pub fn profile(&self) -> Option<User> {
        self.lock().profile.clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.lock().token.is_some()
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Perform a JSON call and return the decoded body (`Null` when empty).
    ///
    /// # Errors
    ///
    /// - [`ClientError::Auth`] on 401; the session is invalidated once.
    /// - [`ClientError::Network`] when unreachable or past the timeout.
    /// - [`ClientError::Server`] on 5xx.
    /// - [`ClientError::Validation`] on any other 4xx.
    /// - [`ClientError::Decode`] when a 2xx body is not JSON.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        let (token, epoch) = self.credential_snapshot();
        let mut builder = self.builder(method, path, &options, token.as_deref());
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.execute(builder, epoch).await
    }

    /// `request` followed by typed decoding.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::request`].
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<T, ClientError> {
        let value = self.request(method, path, body, options).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Multipart upload of a single `file` field.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::request`].
    pub async fn upload(&self, path: &str, filename: &str, bytes: Vec<u8>) -> Result<Value, ClientError> {
        let (token, epoch) = self.credential_snapshot();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_owned());
        let form = reqwest::multipart::Form::new().part("file", part);
        let builder = self
            .builder(Method::POST, path, &RequestOptions::default(), token.as_deref())
            .multipart(form);
        self.execute(builder, epoch).await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// [`ClientError::Auth`] if no refresh token is held or the server rejects
    /// it; otherwise as [`SessionManager::request`].
    pub async fn refresh(&self) -> Result<String, ClientError> {
        let (refresh_token, epoch) = {
            let state = self.lock();
            (state.refresh_token.clone(), state.epoch)
        };
        let Some(refresh_token) = refresh_token else {
            return Err(ClientError::Auth("no refresh token".to_owned()));
        };
        let builder = self.builder(Method::POST, "/auth/refresh", &RequestOptions::default(), Some(&refresh_token));
        let value = self.execute(builder, epoch).await?;
        let body: RefreshResponse = serde_json::from_value(value).map_err(|e| ClientError::Decode(e.to_string()))?;

        let mut state = self.lock();
        if state.epoch != epoch {
            // Logged out or replaced while the refresh was in flight.
            return Err(ClientError::Auth("session changed during refresh".to_owned()));
        }
        state.token = Some(body.access_token.clone());
        state.epoch += 1;
        self.persist(&state);
        debug!("access token refreshed");
        Ok(body.access_token)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn builder(&self, method: Method, path: &str, options: &RequestOptions, token: Option<&str>) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut builder = self
            .http
            .request(method, url)
            .timeout(options.timeout.unwrap_or(self.timeout));
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute(&self, builder: RequestBuilder, epoch: u64) -> Result<Value, ClientError> {
        let response = builder.send().await.map_err(|e| network_error(&e))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| network_error(&e))?;

        if let Err(err) = classify_response(status, &text) {
            if err.is_auth() {
                self.invalidate(epoch);
            }
            return Err(err);
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Clear the session if `epoch` is still current. Returns `true` for the
    /// one caller that performed the invalidation.
    fn invalidate(&self, epoch: u64) -> bool {
        {
            let mut state = self.lock();
            if state.epoch != epoch || state.token.is_none() {
                return false;
            }
            state.token = None;
            state.refresh_token = None;
            state.profile = None;
            state.epoch += 1;
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "credential store clear failed");
            }
        }
        warn!("credential rejected; session invalidated");
        self.bus.emit(&Event::SessionInvalidated);
        true
    }

    fn credential_snapshot(&self) -> (Option<String>, u64) {
        let state = self.lock();
        (state.token.clone(), state.epoch)
    }

    fn persist(&self, state: &SessionState) {
        if let Err(e) = self.store.save(&state.stored()) {
            warn!(error = %e, "credential store save failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Map an HTTP status and body to success or a `ClientError` kind.
pub(crate) fn classify_response(status: u16, body: &str) -> Result<(), ClientError> {
    match status {
        200..=299 => Ok(()),
        401 => Err(ClientError::Auth(server_message(body, status))),
        400..=499 => Err(ClientError::Validation { status, message: server_message(body, status) }),
        500..=599 => Err(ClientError::Server { status, message: server_message(body, status) }),
        _ => Err(ClientError::Network(format!("unexpected status {status}"))),
    }
}

/// Server-provided message: JSON `error`, then `message`, then raw text.
pub(crate) fn server_message(body: &str, status: u16) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message", "msg"] {
            if let Some(msg) = value.get(key).and_then(Value::as_str) {
                return msg.to_owned();
            }
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.len() <= 512 {
        return trimmed.to_owned();
    }
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("request failed")
        .to_owned()
}

fn network_error(err: &reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Network("request timed out".to_owned())
    } else {
        ClientError::Network(err.to_string())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
