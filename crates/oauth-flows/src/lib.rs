//! OAuth 2.0 grant flows for interactive credential acquisition
//!
//! - Device authorization grant (RFC 8628) with server-paced polling
//! - Authorization-code grant with PKCE (RFC 7636) and a loopback redirect
//!   listener on `127.0.0.1`
//! - Token endpoint client for code exchange, device polling and refresh
//! - Optional OpenID Connect ID token validation against the issuer's JWKS
//!
//! Every flow takes a `CancellationToken`; cancelling it aborts the flow at
//! its next await point with `AuthError::Cancelled`.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

pub mod authorization_code;
pub mod callback;
pub mod clock;
pub mod device;
pub mod error;
pub mod http;
pub mod oidc;
pub mod pkce;
pub mod token;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use authorization_code::{
    AuthorizationCodeConfig, AuthorizationCodeFlow, OpenUrl, PendingAuthorization,
};
pub use callback::{CallbackListener, CallbackParams};
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{DeviceAuthorization, DeviceCodeFlow, DevicePrompt};
pub use error::{AuthError, Result};
pub use http::{DEFAULT_HTTP_TIMEOUT, http_client};
pub use oidc::{IdTokenClaims, IdTokenValidator, OidcConfig};
pub use token::{ClientCredentials, TokenEndpoint, TokenResponse};

/// Future returned by user-facing callbacks (prompts, URL openers).
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Race `fut` against `cancel`, failing with `AuthError::Cancelled` if the
/// token fires first.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AuthError::Cancelled),
        out = fut => Ok(out),
    }
}
