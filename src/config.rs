//! Client configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled default so a bare `ClientConfig::default()` talks
//! to a local development server. `from_env()` overlays environment values;
//! unparsable values fall back to the default rather than failing startup.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:5000/ws";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

// =============================================================================
// RECONNECT POLICY
// =============================================================================

/// Exponential backoff with a fixed base and a hard attempt cap.
///
/// Delay growth is uncapped; only the number of attempts is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1_u32 << exponent)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

// =============================================================================
// CLIENT CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL for request/response calls, without trailing slash.
    pub api_url: String,
    /// Push-channel WebSocket endpoint.
    pub ws_url: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// When set, credentials persist to this file between runs.
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            ws_url: DEFAULT_WS_URL.to_owned(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            reconnect: ReconnectPolicy::default(),
            credentials_path: None,
        }
    }
}

impl ClientConfig {
    /// Build config from environment variables.
    ///
    /// Optional:
    /// - `DOCSYNC_API_URL`: default `http://localhost:5000/api`
    /// - `DOCSYNC_WS_URL`: default `ws://localhost:5000/ws`
    /// - `DOCSYNC_REQUEST_TIMEOUT_MS`: default 30000
    /// - `DOCSYNC_HANDSHAKE_TIMEOUT_MS`: default 20000
    /// - `DOCSYNC_RECONNECT_BASE_DELAY_MS`: default 1000
    /// - `DOCSYNC_MAX_RECONNECT_ATTEMPTS`: default 5
    /// - `DOCSYNC_CREDENTIALS_PATH`: unset keeps credentials in memory only
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Used by `from_env` and tests.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_url = lookup("DOCSYNC_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned());
        let ws_url = lookup("DOCSYNC_WS_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WS_URL.to_owned());

        Self {
            api_url: api_url.trim_end_matches('/').to_owned(),
            ws_url,
            request_timeout: Duration::from_millis(parse_or(
                &lookup,
                "DOCSYNC_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )),
            handshake_timeout: Duration::from_millis(parse_or(
                &lookup,
                "DOCSYNC_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "DOCSYNC_RECONNECT_BASE_DELAY_MS",
                    DEFAULT_RECONNECT_BASE_DELAY_MS,
                )),
                max_attempts: parse_or(&lookup, "DOCSYNC_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
            },
            credentials_path: lookup("DOCSYNC_CREDENTIALS_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
