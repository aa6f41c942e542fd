//! Error types for credential acquisition

/// Errors surfaced by providers and grant flows.
///
/// Every variant is terminal for the call that produced it; nothing in this
/// crate retries. Refresh failures never reach callers: the lifecycle turns
/// them into a fresh interactive login.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Malformed constructor or configuration arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server answered with something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authorization server or the user explicitly refused.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// The device code (or other server-side window) ran out.
    #[error("authorization expired: {0}")]
    Expired(String),

    /// The redirect carried a `state` that this flow did not issue.
    #[error("authorization callback state mismatch")]
    CsrfMismatch,

    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    /// Nobody completed the interactive step in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A single HTTP call failed at the transport level.
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl AuthError {
    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Configuration(_) => "configuration",
            AuthError::Protocol(_) => "protocol",
            AuthError::Denied(_) => "denied",
            AuthError::Expired(_) => "expired",
            AuthError::CsrfMismatch => "csrf_mismatch",
            AuthError::ExchangeFailed(_) => "exchange_failed",
            AuthError::Timeout(_) => "timeout",
            AuthError::Http(_) => "http",
            AuthError::Cancelled => "cancelled",
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, AuthError>;
