//! Shared HTTP client construction

use std::time::Duration;

use crate::error::{AuthError, Result};

/// Per-request timeout applied when the caller does not configure one.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the client used for token, device and JWKS requests.
///
/// Each individual request is bounded by `timeout`; a stuck endpoint
/// surfaces as `AuthError::Http` instead of hanging the flow.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("oauth-flows/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AuthError::Configuration(format!("failed to build HTTP client: {e}")))
}
