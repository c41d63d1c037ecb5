//! Client-side session and realtime sync layer for the document/chat service.
//!
//! ARCHITECTURE
//! ============
//! Two transports: request/response calls through [`session::SessionManager`]
//! and one persistent push channel owned by
//! [`connection::ConnectionManager`]. Everything else reacts to typed
//! [`events::Event`]s fanned out by [`events::EventBus`].
//!
//! - `events`: in-process publish/subscribe with per-listener panic isolation.
//! - `session`: credentials, request classification, one-shot invalidation.
//! - `connection`: connect/handshake/backoff state machine.
//! - `registry`: reference-counted rooms, replayed on every `Connected`.
//! - `reconciler`: optimistic list mutations reconciled with server results.
//! - `context`: [`SyncContext`] wires one of each with an `init`/`dispose`
//!   lifecycle.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod frame;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use config::ClientConfig;
pub use connection::ConnectionStatus;
pub use context::SyncContext;
pub use error::{ClientError, ErrorCode};
pub use events::{Event, EventBus, EventKind};
