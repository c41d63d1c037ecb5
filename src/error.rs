//! Client error taxonomy.
//!
//! DESIGN
//! ======
//! Request failures are classified once, at the transport boundary, into the
//! kinds UI code actually branches on: the credential was rejected, the server
//! was unreachable, the server faulted, or the request itself was refused.
//! `ErrorCode` gives each variant a grepable code and a retryable flag, the
//! same contract the server uses on its error frames.

/// Grepable error code and retryable flag.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The credential was rejected or has expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server could not be reached or the call timed out.
    #[error("network error: {0}")]
    Network(String),

    /// 5xx-equivalent response.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 4xx-equivalent response other than an auth rejection.
    #[error("request rejected {status}: {message}")]
    Validation { status: u16, message: String },

    /// An optimistic submit was attempted while another is still pending.
    #[error("a submission is already in flight")]
    Busy,

    /// A successful response carried a body we could not decode.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Invalid client configuration (bad URL, bad header value).
    #[error("config error: {0}")]
    Config(String),

    /// Persisted credential storage failed.
    #[error("credential store error: {0}")]
    Store(String),
}

impl ClientError {
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl ErrorCode for ClientError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "E_AUTH",
            Self::Network(_) => "E_NETWORK",
            Self::Server { .. } => "E_SERVER",
            Self::Validation { .. } => "E_VALIDATION",
            Self::Busy => "E_BUSY",
            Self::Decode(_) => "E_DECODE",
            Self::Config(_) => "E_CONFIG",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Busy)
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
