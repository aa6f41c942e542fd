//! Device authorization grant (RFC 8628)
//!
//! `Requesting -> Prompting -> Polling -> Issued | Denied | Expired | Cancelled`
//!
//! The flow asks the server for a device code, hands the user code and
//! verification URI to the caller's prompt, then polls the token endpoint at
//! the server's interval until a token is issued or the code runs out.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use token_store::TokenData;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AuthError, Result};
use crate::token::{DevicePoll, OAuthErrorBody, TokenEndpoint};
use crate::{CallbackFuture, cancellable};

/// Poll interval when the server does not send one (RFC 8628 section 3.2).
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
/// Added to the interval on every `slow_down` answer.
pub const SLOW_DOWN_STEP_SECS: u64 = 5;

/// What the user needs to complete the login elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub user_code: String,
    pub expires_in: Duration,
}

/// Shows the user code and verification URI. Awaited once per login.
pub type DevicePrompt = Arc<dyn Fn(DeviceAuthorization) -> CallbackFuture + Send + Sync>;

#[derive(Deserialize)]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default, alias = "verification_url_complete")]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<i64>,
}

/// Zero or negative intervals are clamped to one second.
fn poll_interval(advertised: Option<i64>) -> Duration {
    match advertised {
        None => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        Some(secs) => Duration::from_secs(secs.max(1) as u64),
    }
}

pub struct DeviceCodeFlow {
    endpoint: TokenEndpoint,
    device_authorization_endpoint: String,
    scope: Option<String>,
    prompt: DevicePrompt,
    clock: Arc<dyn Clock>,
}

impl DeviceCodeFlow {
    pub fn new(
        endpoint: TokenEndpoint,
        device_authorization_endpoint: impl Into<String>,
        scope: Option<String>,
        prompt: DevicePrompt,
    ) -> Result<Self> {
        let device_authorization_endpoint = device_authorization_endpoint.into();
        reqwest::Url::parse(&device_authorization_endpoint).map_err(|e| {
            AuthError::Configuration(format!(
                "invalid device authorization endpoint {device_authorization_endpoint:?}: {e}"
            ))
        })?;
        Ok(Self {
            endpoint,
            device_authorization_endpoint,
            scope: scope.filter(|s| !s.trim().is_empty()),
            prompt,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn endpoint(&self) -> &TokenEndpoint {
        &self.endpoint
    }

    /// Run the whole grant and return the issued token.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<TokenData> {
        let grant = cancellable(cancel, self.request_authorization()).await??;
        let lifetime = Duration::from_secs(grant.expires_in);
        let deadline = Instant::now() + lifetime;
        info!(
            verification_uri = %grant.verification_uri,
            expires_in_secs = grant.expires_in,
            "device authorization started, waiting for user"
        );

        let authorization = DeviceAuthorization {
            verification_uri: grant.verification_uri.clone(),
            verification_uri_complete: grant.verification_uri_complete.clone(),
            user_code: grant.user_code.clone(),
            expires_in: lifetime,
        };
        let prompt = (self.prompt)(authorization);
        if cancellable(cancel, tokio::time::timeout_at(deadline, prompt))
            .await?
            .is_err()
        {
            return Err(AuthError::Expired(
                "device code expired while prompting the user".into(),
            ));
        }

        let mut interval = poll_interval(grant.interval);
        let mut polls: u32 = 0;
        loop {
            cancellable(cancel, tokio::time::sleep(interval)).await?;
            if Instant::now() >= deadline {
                warn!(polls, "device code expired before the user approved");
                return Err(AuthError::Expired(format!(
                    "device code expired after {polls} polls"
                )));
            }

            polls += 1;
            match cancellable(cancel, self.endpoint.poll_device(&grant.device_code)).await?? {
                DevicePoll::Issued(response) => {
                    info!(polls, "device authorization granted");
                    return response.into_token_data(self.clock.now_millis(), None);
                }
                DevicePoll::Pending => debug!(polls, "authorization pending"),
                DevicePoll::SlowDown => {
                    interval += Duration::from_secs(SLOW_DOWN_STEP_SECS);
                    debug!(
                        polls,
                        interval_secs = interval.as_secs(),
                        "server asked to slow down"
                    );
                }
                DevicePoll::Rejected(err) => return Err(terminal(err)),
            }
        }
    }

    async fn request_authorization(&self) -> Result<DeviceAuthorizationResponse> {
        let mut params = vec![("client_id", self.endpoint.client_id())];
        if let Some(scope) = &self.scope {
            params.push(("scope", scope.as_str()));
        }
        let response = self
            .endpoint
            .http()
            .post(&self.device_authorization_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Http(format!("device authorization request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Http(format!("reading device authorization response: {e}")))?;

        if !status.is_success() {
            return Err(AuthError::Protocol(
                match serde_json::from_str::<OAuthErrorBody>(&body) {
                    Ok(err) => format!("device authorization rejected ({status}): {err}"),
                    Err(_) => format!("device authorization endpoint returned {status}"),
                },
            ));
        }

        let grant: DeviceAuthorizationResponse = serde_json::from_str(&body).map_err(|e| {
            AuthError::Protocol(format!("invalid device authorization response: {e}"))
        })?;
        if grant.device_code.is_empty()
            || grant.user_code.is_empty()
            || grant.verification_uri.is_empty()
        {
            return Err(AuthError::Protocol(
                "device authorization response is missing required fields".into(),
            ));
        }
        Ok(grant)
    }
}

fn terminal(err: OAuthErrorBody) -> AuthError {
    match err.error.as_str() {
        "expired_token" => AuthError::Expired(err.to_string()),
        _ => AuthError::Denied(err.to_string()),
    }
}
