//! Realtime connection manager: one push channel, its state machine, backoff.
//!
//! ARCHITECTURE
//! ============
//! `ConnectionManager` owns the single `Connection` record (status, attempt
//! counter, credential) and a driver task per `connect()` call. The driver
//! performs the handshake through a `Connector`, pumps inbound frames into the
//! event bus while the channel is live, and schedules reconnects when it
//! drops.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!                               │                 │ drop
//!                               ▼ fail            ▼
//!                          Reconnecting ◀─────────┘
//!                           │        │
//!                        ok ▼        ▼ attempts exhausted
//!                      Connected   Failed
//! ```
//!
//! Any state returns to Disconnected through `disconnect()`.
//!
//! DESIGN
//! ======
//! - Generation fencing: every `connect`/`disconnect` bumps a generation. A
//!   driver only touches shared state while its generation is current, so an
//!   aborted or superseded driver can never resurrect an old connection.
//! - The state lock is never held across an `.await` nor while emitting.
//! - `disconnect()` aborts the driver task, which cancels a pending backoff
//!   sleep or handshake before the call returns.
//! - The handshake timeout wraps the whole `Connector::open` future.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::ErrorCode;
use crate::events::{Event, EventBus};
use crate::frame::{self, PushFrame};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a handshake did not produce a live channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed during handshake")]
    Closed,
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl ErrorCode for HandshakeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "E_HANDSHAKE_REJECTED",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Closed => "E_CHANNEL_CLOSED",
            Self::Timeout(_) => "E_HANDSHAKE_TIMEOUT",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// A live, handshaken push channel.
///
/// Dropping `outbound` asks the transport to close. The transport closing
/// ends `inbound`.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<PushFrame>,
    pub inbound: mpsc::UnboundedReceiver<PushFrame>,
}

/// Opens a push channel and completes the credential handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, token: &str) -> Result<Channel, HandshakeError>;
}

// =============================================================================
// WEBSOCKET CONNECTOR
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn transport(err: impl std::fmt::Display) -> HandshakeError {
    HandshakeError::Transport(err.to_string())
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, token: &str) -> Result<Channel, HandshakeError> {
        let (mut stream, _) = connect_async(self.url.as_str()).await.map_err(transport)?;
        stream
            .send(Message::Text(PushFrame::handshake(token).encode().into()))
            .await
            .map_err(transport)?;

        loop {
            let Some(msg) = stream.next().await else {
                return Err(HandshakeError::Closed);
            };
            match msg.map_err(transport)? {
                Message::Text(text) => {
                    let reply = match PushFrame::decode(text.as_str()) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed handshake reply");
                            continue;
                        }
                    };
                    match reply.event.as_str() {
                        frame::CONNECTED => break,
                        frame::ERROR => {
                            let reason = reply.message().unwrap_or("handshake rejected").to_owned();
                            return Err(HandshakeError::Rejected(reason));
                        }
                        other => debug!(event = other, "frame before handshake reply"),
                    }
                }
                Message::Close(_) => return Err(HandshakeError::Closed),
                _ => {}
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, out_rx, in_tx));
        Ok(Channel { outbound: out_tx, inbound: in_rx })
    }
}

/// Shuttle frames between the socket and the channel halves until either
/// side goes away.
async fn pump(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<PushFrame>,
    inbound: mpsc::UnboundedSender<PushFrame>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(frame) = out else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame.encode().into())).await {
                    warn!(error = %e, "push channel send failed");
                    break;
                }
            }
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => match PushFrame::decode(text.as_str()) {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed push frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "push channel receive failed");
                    break;
                }
            }
        }
    }
    debug!("push channel pump exited");
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Default)]
struct ConnectionState {
    status: ConnectionStatus,
    attempt: u32,
    token: Option<String>,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<PushFrame>>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionState {
    /// Stop the driver and forget the channel. Leaves `token` untouched.
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.outbound = None;
        self.status = ConnectionStatus::Disconnected;
        self.attempt = 0;
    }
}

enum Retry {
    After { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        policy: ReconnectPolicy,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            bus,
            policy,
            handshake_timeout,
            state: Mutex::new(ConnectionState::default()),
        })
    }

    /// Manager with a WebSocket connector for `config.ws_url`.
    #[must_use]
    pub fn from_config(config: &ClientConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Self::new(
            Arc::new(WsConnector::new(config.ws_url.clone())),
            bus,
            config.reconnect,
            config.handshake_timeout,
        )
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Start connecting with `token` without waiting for the handshake.
    ///
    /// A no-op while Connected, Connecting or Reconnecting with the same
    /// token; a pending retry keeps its attempt count. A new token, or a
    /// call from Disconnected or Failed, tears down and starts over.
    pub fn connect(self: &Arc<Self>, token: &str) {
        let mut state = self.lock();
        let live = matches!(
            state.status,
            ConnectionStatus::Connected | ConnectionStatus::Connecting | ConnectionStatus::Reconnecting
        );
        if live && state.token.as_deref() == Some(token) {
            debug!(status = %state.status, "connect ignored; already live with this token");
            return;
        }

        state.teardown();
        state.status = ConnectionStatus::Connecting;
        state.token = Some(token.to_owned());
        let generation = state.generation;
        let this = Arc::clone(self);
        let token = token.to_owned();
        state.driver = Some(tokio::spawn(async move { this.drive(generation, token).await }));
        info!(generation, "push channel connecting");
    }

    /// Force Disconnected, cancel any pending handshake or backoff timer and
    /// reset the attempt counter. Emits nothing.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        let prior = state.status;
        state.teardown();
        state.token = None;
        if prior != ConnectionStatus::Disconnected {
            info!(from = %prior, "push channel disconnected");
        }
    }

    /// Queue `frame` on the live channel. Returns `false` unless Connected.
    pub fn send(&self, frame: PushFrame) -> bool {
        let state = self.lock();
        if state.status != ConnectionStatus::Connected {
            return false;
        }
        state.outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    // -------------------------------------------------------------------------
    // Driver
    // -------------------------------------------------------------------------

    async fn drive(self: Arc<Self>, generation: u64, token: String) {
        loop {
            let outcome = match tokio::time::timeout(self.handshake_timeout, self.connector.open(&token)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HandshakeError::Timeout(self.handshake_timeout)),
            };

            let lost = match outcome {
                Ok(channel) => match self.run_channel(generation, channel).await {
                    Some(reason) => Event::Disconnected { reason },
                    None => return,
                },
                Err(err) => {
                    warn!(error = %err, code = err.error_code(), "push handshake failed");
                    Event::ConnectionError { error: err.to_string() }
                }
            };

            let Some(retry) = self.next_retry(generation) else {
                return;
            };
            self.bus.emit(&lost);
            match retry {
                Retry::After { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis(), "push channel reconnect scheduled");
                    self.bus.emit(&Event::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                    if !self.is_current(generation) {
                        return;
                    }
                }
                Retry::Exhausted { attempts } => {
                    warn!(attempts, "push channel reconnect attempts exhausted");
                    self.bus.emit(&Event::MaxReconnectAttempts { attempts });
                    return;
                }
            }
        }
    }

    /// Publish a fresh channel, then dispatch inbound frames until it ends.
    /// Returns the drop reason, or `None` if this driver was superseded.
    async fn run_channel(&self, generation: u64, channel: Channel) -> Option<String> {
        let Channel { outbound, mut inbound } = channel;
        {
            let mut state = self.lock();
            if state.generation != generation {
                return None;
            }
            state.status = ConnectionStatus::Connected;
            state.attempt = 0;
            state.outbound = Some(outbound);
        }
        info!(generation, "push channel connected");
        self.bus.emit(&Event::Connected);

        while let Some(frame) = inbound.recv().await {
            if !self.is_current(generation) {
                return None;
            }
            let name = frame.event.clone();
            match frame.into_event() {
                Some(event) => {
                    self.bus.emit(&event);
                }
                None => debug!(event = %name, "unhandled push frame"),
            }
        }
        Some("transport closed".to_owned())
    }

    /// Advance the attempt counter after a failure or drop. Returns `None`
    /// when this driver is no longer current.
    fn next_retry(&self, generation: u64) -> Option<Retry> {
        let mut state = self.lock();
        if state.generation != generation {
            return None;
        }
        state.outbound = None;
        if state.attempt >= self.policy.max_attempts {
            state.status = ConnectionStatus::Failed;
            return Some(Retry::Exhausted { attempts: state.attempt });
        }
        state.attempt += 1;
        state.status = ConnectionStatus::Reconnecting;
        Some(Retry::After { attempt: state.attempt, delay: self.policy.delay_for(state.attempt) })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
