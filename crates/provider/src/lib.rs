//! Authentication providers for outbound API requests
//!
//! A caller builds one `AuthenticationProvider` per target API and calls
//! `apply` on every outbound `reqwest::Request`. Static schemes (API key,
//! Basic, Bearer) mutate the request directly. Interactive schemes (device
//! code, authorization code with PKCE) go through `TokenLifecycle`: cached
//! token, then one refresh, then a full login, persisted in a `TokenStore`.

pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod static_auth;

pub use config::{AuthConfig, ProviderConfig, ProviderContext};
pub use lifecycle::{EXPIRY_SKEW, InteractiveFlow, TokenLifecycle};
pub use static_auth::{ApiKeyLocation, ApiKeyProvider, BasicProvider, BearerProvider};

use oauth_flows::{AuthError, Result};
use reqwest::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;

/// Session used by `apply` when the caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Closed set of supported authentication schemes.
pub enum AuthenticationProvider {
    ApiKey(ApiKeyProvider),
    Basic(BasicProvider),
    Bearer(BearerProvider),
    DeviceCode(TokenLifecycle),
    AuthorizationCode(TokenLifecycle),
}

impl std::fmt::Debug for AuthenticationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationProvider")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl AuthenticationProvider {
    /// Scheme identifier for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthenticationProvider::ApiKey(_) => "api_key",
            AuthenticationProvider::Basic(_) => "basic",
            AuthenticationProvider::Bearer(_) => "bearer",
            AuthenticationProvider::DeviceCode(_) => "device_code",
            AuthenticationProvider::AuthorizationCode(_) => "authorization_code",
        }
    }

    /// Provider name for interactive schemes, the scheme kind otherwise.
    pub fn name(&self) -> &str {
        match self {
            AuthenticationProvider::DeviceCode(lifecycle)
            | AuthenticationProvider::AuthorizationCode(lifecycle) => lifecycle.provider_name(),
            other => other.kind(),
        }
    }

    /// Attach credentials for the default session.
    pub async fn apply(
        &self,
        request: &mut reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.apply_for_session(request, DEFAULT_SESSION, cancel).await
    }

    /// Attach credentials for `session_id`. Static schemes ignore the session.
    pub async fn apply_for_session(
        &self,
        request: &mut reqwest::Request,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self {
            AuthenticationProvider::ApiKey(provider) => provider.apply(request),
            AuthenticationProvider::Basic(provider) => provider.apply(request),
            AuthenticationProvider::Bearer(provider) => provider.apply(request),
            AuthenticationProvider::DeviceCode(lifecycle)
            | AuthenticationProvider::AuthorizationCode(lifecycle) => {
                let token = lifecycle.token(session_id, cancel).await?;
                let header = static_auth::bearer_header(token.access_token()).map_err(|_| {
                    AuthError::Protocol("issued access token is not a valid header value".into())
                })?;
                request.headers_mut().insert(AUTHORIZATION, header);
            }
        }
        Ok(())
    }

    /// Delete the stored token for `session_id`. No-op for static schemes.
    pub async fn sign_out(&self, session_id: &str) -> token_store::Result<()> {
        match self {
            AuthenticationProvider::DeviceCode(lifecycle)
            | AuthenticationProvider::AuthorizationCode(lifecycle) => {
                lifecycle.sign_out(session_id).await
            }
            _ => Ok(()),
        }
    }
}
