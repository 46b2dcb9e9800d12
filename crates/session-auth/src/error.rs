//! Session authentication error types.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a token renewal.
///
/// Cloneable because a single renewal outcome is handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    /// Renewal requested with nothing to renew.
    #[error("No refresh token - login required")]
    NoRefreshToken,

    /// Another renewal is already running and the contention policy rejects.
    #[error("Token renewal already in progress")]
    InProgress,

    /// Server refused the refresh token (expired or revoked).
    #[error("Refresh token rejected by server (HTTP {status})")]
    Rejected { status: StatusCode },

    /// Network-level failure during the exchange.
    #[error("Network error during token renewal: {0}")]
    Transport(String),

    /// Exchange succeeded at HTTP level but the body carried no usable token.
    #[error("Malformed renewal response: {0}")]
    Malformed(String),

    /// Exchange did not complete within the configured renewal timeout.
    #[error("Token renewal timed out after {0:?}")]
    TimedOut(Duration),

    /// Renewal task ended without producing an outcome.
    #[error("Token renewal aborted")]
    Aborted,

    /// The exchange finished after a logout or a new login replaced the
    /// session it was started for. Its token was discarded and the current
    /// session was left as is.
    #[error("Session changed while renewing")]
    Superseded,
}

impl RenewalError {
    /// Whether this failure ended the session.
    ///
    /// Fail-fast errors (`NoRefreshToken`, `InProgress`) never touch session
    /// state, and `Superseded` leaves whatever session replaced the renewed one.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::NoRefreshToken | Self::InProgress | Self::Superseded
        )
    }
}

/// Errors surfaced by the session client.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token renewal failed.
    #[error(transparent)]
    Renewal(#[from] RenewalError),

    /// Network error on an ordinary request. No session impact.
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status on an ordinary request.
    #[error("Request to {url} failed with HTTP {status}")]
    Status { status: StatusCode, url: String },

    /// Username/password refused by the login endpoint.
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Token failed structural validation.
    #[error("Invalid token: {0}")]
    InvalidToken(&'static str),

    /// Response body could not be decoded.
    #[error("Failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// Endpoint path could not be joined onto the API base.
    #[error("Invalid URL `{input}`: {source}")]
    InvalidUrl {
        input: String,
        #[source]
        source: url::ParseError,
    },

    /// A logout or new login replaced the session while the request was in
    /// flight, so its result was not applied.
    #[error("Session changed while the request was in flight")]
    SessionChanged,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error requires the user to log in again.
    pub fn requires_relogin(&self) -> bool {
        match self {
            Self::Renewal(e) => e.is_terminal() || *e == RenewalError::NoRefreshToken,
            Self::InvalidCredentials => true,
            _ => false,
        }
    }

    /// Check if this error is transient and the caller may retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Renewal(RenewalError::InProgress) => true,
            Self::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Renewal(RenewalError::Rejected { status }) => Some(*status),
            Self::Transport(e) => e.status(),
            _ => None,
        }
    }
}
