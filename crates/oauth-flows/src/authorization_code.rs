//! Authorization-code grant with PKCE and a loopback redirect
//!
//! `Preparing -> ListenerBound -> Prompted -> Redirected -> Exchanged | Failed`
//!
//! `run` drives the whole thing. `begin` and `complete` split it for hosts
//! that receive the redirect themselves (a web app, a remote session): keep
//! the `PendingAuthorization` from `begin` and hand the redirect parameters
//! to `complete`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use token_store::TokenData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::{CallbackListener, CallbackParams};
use crate::clock::{Clock, SystemClock};
use crate::error::{AuthError, Result};
use crate::oidc::IdTokenValidator;
use crate::pkce::{
    AuthorizationRequest, build_authorization_url, compute_challenge, generate_state,
    generate_verifier,
};
use crate::token::TokenEndpoint;
use crate::{CallbackFuture, cancellable};

pub const DEFAULT_REDIRECT_PATH: &str = "/callback";
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Opens (or displays) the authorization URL. Awaited once per login.
pub type OpenUrl = Arc<dyn Fn(String) -> CallbackFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AuthorizationCodeConfig {
    pub authorization_endpoint: String,
    pub scope: Option<String>,
    /// Loopback port for the redirect listener; `0` picks a free one.
    pub redirect_port: u16,
    pub redirect_path: String,
    /// Upper bound on the whole interactive step.
    pub timeout: Duration,
}

impl AuthorizationCodeConfig {
    pub fn new(authorization_endpoint: impl Into<String>) -> Self {
        Self {
            authorization_endpoint: authorization_endpoint.into(),
            scope: None,
            redirect_port: 0,
            redirect_path: DEFAULT_REDIRECT_PATH.to_string(),
            timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }
}

/// State of one in-flight authorization attempt.
///
/// Holds the PKCE verifier; never persist it or send it anywhere but the
/// token endpoint.
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub redirect_uri: String,
    state: String,
    verifier: String,
}

impl PendingAuthorization {
    pub fn state(&self) -> &str {
        &self.state
    }
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("authorization_url", &self.authorization_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("verifier", &"[REDACTED]")
            .finish()
    }
}

pub struct AuthorizationCodeFlow {
    endpoint: TokenEndpoint,
    config: AuthorizationCodeConfig,
    open_url: OpenUrl,
    id_tokens: Option<IdTokenValidator>,
    clock: Arc<dyn Clock>,
}

impl AuthorizationCodeFlow {
    pub fn new(
        endpoint: TokenEndpoint,
        config: AuthorizationCodeConfig,
        open_url: OpenUrl,
    ) -> Result<Self> {
        reqwest::Url::parse(&config.authorization_endpoint).map_err(|e| {
            AuthError::Configuration(format!(
                "invalid authorization endpoint {:?}: {e}",
                config.authorization_endpoint
            ))
        })?;
        if !config.redirect_path.starts_with('/') {
            return Err(AuthError::Configuration(format!(
                "redirect path must start with '/': {:?}",
                config.redirect_path
            )));
        }
        if config.timeout.is_zero() {
            return Err(AuthError::Configuration("login timeout must be positive".into()));
        }
        Ok(Self {
            endpoint,
            config,
            open_url,
            id_tokens: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Verify `id_token`s in token responses before accepting them.
    pub fn with_id_token_validation(mut self, validator: IdTokenValidator) -> Self {
        self.id_tokens = Some(validator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn endpoint(&self) -> &TokenEndpoint {
        &self.endpoint
    }

    /// Generate verifier, challenge and state, and build the URL the user
    /// must visit.
    pub fn begin(&self, redirect_uri: &str) -> Result<PendingAuthorization> {
        let verifier = generate_verifier();
        let state = generate_state();
        let challenge = compute_challenge(&verifier);
        let authorization_url = build_authorization_url(
            &self.config.authorization_endpoint,
            &AuthorizationRequest {
                client_id: self.endpoint.client_id(),
                redirect_uri,
                scope: self.config.scope.as_deref(),
                challenge: &challenge,
                state: &state,
            },
        )?;
        Ok(PendingAuthorization {
            authorization_url,
            redirect_uri: redirect_uri.to_string(),
            state,
            verifier,
        })
    }

    /// Check the redirect against `pending` and exchange the code.
    pub async fn complete(
        &self,
        pending: &PendingAuthorization,
        params: CallbackParams,
        cancel: &CancellationToken,
    ) -> Result<TokenData> {
        // State first: an error redirect we did not ask for is still forged.
        if params.state.as_deref() != Some(pending.state.as_str()) {
            warn!("authorization redirect carried an unexpected state, rejecting");
            return Err(AuthError::CsrfMismatch);
        }
        if let Some(error) = params.error {
            let detail = match params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(AuthError::Denied(detail));
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::Protocol("authorization redirect carried no code".into()))?;

        let response = cancellable(
            cancel,
            self.endpoint
                .exchange_code(&code, &pending.verifier, &pending.redirect_uri),
        )
        .await??;

        if let (Some(validator), Some(id_token)) = (&self.id_tokens, response.id_token.as_deref()) {
            cancellable(cancel, validator.validate(id_token)).await??;
        }

        let token = response
            .into_token_data(self.clock.now_millis(), None)
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;
        info!(has_refresh_token = token.refresh_token().is_some(), "authorization code exchanged");
        Ok(token)
    }

    /// Run the full interactive flow on a loopback listener.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<TokenData> {
        let listener =
            CallbackListener::bind(self.config.redirect_port, &self.config.redirect_path).await?;
        let pending = self.begin(&listener.redirect_uri())?;
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        debug!(redirect_uri = %pending.redirect_uri, "waiting for authorization redirect");

        let open = (self.open_url)(pending.authorization_url.clone());
        if cancellable(cancel, tokio::time::timeout_at(deadline, open))
            .await?
            .is_err()
        {
            return Err(AuthError::Timeout(
                "opening the authorization URL did not finish in time".into(),
            ));
        }

        let params = listener.wait(deadline, cancel).await?;
        self.complete(&pending, params, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAuthServer;
    use crate::token::ClientCredentials;

    /// Follows the authorization URL the way a browser would.
    fn browser() -> OpenUrl {
        Arc::new(|url| -> CallbackFuture {
            Box::pin(async move {
                tokio::spawn(async move {
                    let _ = reqwest::get(url).await;
                });
            })
        })
    }

    fn flow(server: &MockAuthServer, open_url: OpenUrl, timeout: Duration) -> AuthorizationCodeFlow {
        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            server.url("/token"),
            ClientCredentials::public("client-1"),
        )
        .unwrap();
        let mut config = AuthorizationCodeConfig::new(server.url("/authorize"));
        config.scope = Some("openid".into());
        config.timeout = timeout;
        AuthorizationCodeFlow::new(endpoint, config, open_url).unwrap()
    }

    #[tokio::test]
    async fn completes_through_loopback_redirect() {
        let server = MockAuthServer::start().await;
        let token = flow(&server, browser(), Duration::from_secs(10))
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(token.access_token(), "code-access");
        assert_eq!(token.refresh_token(), Some("code-refresh"));

        let form = server.state.last_request("authorization_code").unwrap();
        assert!(form["redirect_uri"].starts_with("http://127.0.0.1:"));
        assert_eq!(form["client_id"], "client-1");
    }

    #[tokio::test]
    async fn forged_state_is_rejected_without_exchange() {
        let server = MockAuthServer::start().await;
        server.state.forge_state(Some("attacker-state"));

        let err = flow(&server, browser(), Duration::from_secs(10))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CsrfMismatch));
        assert_eq!(server.state.grants("authorization_code"), 0);
    }

    #[tokio::test]
    async fn error_redirect_is_denied() {
        let server = MockAuthServer::start().await;
        server.state.set_authorize_error(Some("access_denied"));

        let err = flow(&server, browser(), Duration::from_secs(10))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Denied(ref m) if m.contains("access_denied")));
    }

    #[tokio::test]
    async fn nobody_redirecting_times_out() {
        let server = MockAuthServer::start().await;
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });

        let err = flow(&server, ignore, Duration::from_millis(300))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)));
    }

    #[tokio::test]
    async fn hanging_open_url_times_out() {
        let server = MockAuthServer::start().await;
        let hang: OpenUrl =
            Arc::new(|_| -> CallbackFuture { Box::pin(std::future::pending::<()>()) });

        let err = flow(&server, hang, Duration::from_millis(300))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_while_waiting() {
        let server = MockAuthServer::start().await;
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });
        let flow = flow(&server, ignore, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let err = flow.run(&cancel).await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn begin_and_complete_split() {
        let server = MockAuthServer::start().await;
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });
        let flow = flow(&server, ignore, Duration::from_secs(10));

        let pending = flow.begin("https://app.example.com/oauth/callback").unwrap();
        assert!(pending.authorization_url.contains("code_challenge_method=S256"));
        assert!(!format!("{pending:?}").contains(&pending.verifier));

        // Registers the challenge with the mock, as a browser visit would.
        let no_redirects = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let response = no_redirects
            .get(&pending.authorization_url)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 302);

        let params = CallbackParams {
            code: Some(crate::testing::AUTH_CODE.into()),
            state: Some(pending.state().to_string()),
            ..Default::default()
        };
        let token = flow
            .complete(&pending, params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token.access_token(), "code-access");
    }

    #[tokio::test]
    async fn error_redirect_with_foreign_state_is_csrf_mismatch() {
        let server = MockAuthServer::start().await;
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });
        let flow = flow(&server, ignore, Duration::from_secs(10));
        let pending = flow.begin("https://app.example.com/oauth/callback").unwrap();

        for state in [Some("attacker".to_string()), None] {
            let params = CallbackParams {
                error: Some("access_denied".into()),
                state,
                ..Default::default()
            };
            let err = flow
                .complete(&pending, params, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::CsrfMismatch), "got: {err:?}");
        }

        // With our own state the same redirect is a genuine denial.
        let params = CallbackParams {
            error: Some("access_denied".into()),
            state: Some(pending.state().to_string()),
            ..Default::default()
        };
        let err = flow
            .complete(&pending, params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Denied(ref m) if m == "access_denied"));
        assert_eq!(server.state.grants("authorization_code"), 0);
    }

    #[tokio::test]
    async fn wrong_verifier_fails_exchange() {
        let server = MockAuthServer::start().await;
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });
        let flow = flow(&server, ignore, Duration::from_secs(10));

        // The mock never saw this attempt's challenge.
        let pending = flow.begin("https://app.example.com/cb").unwrap();
        let params = CallbackParams {
            code: Some(crate::testing::AUTH_CODE.into()),
            state: Some(pending.state().to_string()),
            ..Default::default()
        };
        let err = flow
            .complete(&pending, params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExchangeFailed(_)));
    }

    #[tokio::test]
    async fn unverifiable_id_token_fails_exchange() {
        let server = MockAuthServer::start().await;
        server.state.set_id_token(Some("not.a.jwt"));
        let validator = IdTokenValidator::new(
            reqwest::Client::new(),
            crate::oidc::OidcConfig {
                issuer: "https://issuer.example.com".into(),
                jwks_uri: server.url("/jwks"),
                audience: None,
            },
            "client-1",
        )
        .unwrap();
        let flow =
            flow(&server, browser(), Duration::from_secs(10)).with_id_token_validation(validator);

        let err = flow.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::ExchangeFailed(_)));
    }

    #[test]
    fn relative_redirect_path_rejected() {
        let endpoint = TokenEndpoint::new(
            reqwest::Client::new(),
            "https://auth.example.com/token",
            ClientCredentials::public("client-1"),
        )
        .unwrap();
        let mut config = AuthorizationCodeConfig::new("https://auth.example.com/authorize");
        config.redirect_path = "callback".into();
        let ignore: OpenUrl = Arc::new(|_| -> CallbackFuture { Box::pin(async {}) });
        assert!(matches!(
            AuthorizationCodeFlow::new(endpoint, config, ignore),
            Err(AuthError::Configuration(_))
        ));
    }
}
