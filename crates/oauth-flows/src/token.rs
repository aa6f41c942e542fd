//! OAuth token endpoint client
//!
//! Handles the three token endpoint interactions:
//! 1. Authorization code exchange (browser flow completion)
//! 2. Device code polling (RFC 8628 section 3.4)
//! 3. Token refresh
//!
//! All three POST a form to the same endpoint with different grant types.
//! Error bodies are parsed per RFC 6749 section 5.2 so callers branch on the
//! `error` code rather than on status text. Some servers answer device polls
//! with `200 OK` and an error body; that shape is recognised too.

use std::fmt;

use common::Secret;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use token_store::TokenData;
use tracing::debug;

use crate::error::{AuthError, Result};

pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Identity of the OAuth client registered with the authorization server.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    /// Confidential clients only; sent as `client_secret` in the form body.
    pub client_secret: Option<Secret<String>>,
}

impl ClientCredentials {
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
        }
    }
}

/// Successful token endpoint response for any grant.
///
/// `expires_in` is a delta in seconds from the response time; servers that
/// omit it issue tokens with no known expiry.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

impl TokenResponse {
    /// Convert into the stored form, stamping an absolute expiry.
    ///
    /// When the server does not rotate the refresh token, `previous_refresh`
    /// is carried over so the next refresh still has something to send.
    pub fn into_token_data(
        self,
        now_millis: u64,
        previous_refresh: Option<&str>,
    ) -> Result<TokenData> {
        let expires_at = self
            .expires_in
            .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000)));
        let refresh = self
            .refresh_token
            .filter(|r| !r.trim().is_empty())
            .or_else(|| previous_refresh.map(str::to_owned));
        let token = TokenData::new(self.access_token, refresh, expires_at).map_err(|e| {
            AuthError::Protocol(format!("token endpoint returned an unusable token: {e}"))
        })?;
        Ok(match self.id_token.filter(|t| !t.is_empty()) {
            Some(id_token) => token.with_id_token(id_token),
            None => token,
        })
    }
}

/// RFC 6749 error body.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl fmt::Display for OAuthErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {description}", self.error),
            None => f.write_str(&self.error),
        }
    }
}

/// Result of a single device-code poll.
#[derive(Debug)]
pub enum DevicePoll {
    Issued(TokenResponse),
    Pending,
    SlowDown,
    /// Terminal server answer such as `access_denied` or `expired_token`.
    Rejected(OAuthErrorBody),
}

enum Reply {
    Token(TokenResponse),
    OAuthError(OAuthErrorBody),
    /// 2xx whose body is neither a token nor an OAuth error.
    Malformed(String),
    /// Non-2xx without an OAuth error body, e.g. an HTML page from a proxy.
    Failed(String),
}

/// Client for one authorization server's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: reqwest::Client,
    url: String,
    client: ClientCredentials,
}

impl TokenEndpoint {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        client: ClientCredentials,
    ) -> Result<Self> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| AuthError::Configuration(format!("invalid token endpoint {url:?}: {e}")))?;
        if client.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id must not be empty".into()));
        }
        Ok(Self { http, url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Exchange an authorization code plus PKCE verifier for tokens.
    ///
    /// Every failure, transport included, is reported as `ExchangeFailed`.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let reply = self
            .send(vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("redirect_uri", redirect_uri),
            ])
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;
        match reply {
            Reply::Token(token) => Ok(token),
            Reply::OAuthError(err) => Err(AuthError::ExchangeFailed(err.to_string())),
            Reply::Malformed(detail) | Reply::Failed(detail) => {
                Err(AuthError::ExchangeFailed(detail))
            }
        }
    }

    /// Redeem a refresh token.
    pub async fn refresh(&self, refresh_token: &str, scope: Option<&str>) -> Result<TokenResponse> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(scope) = scope {
            params.push(("scope", scope));
        }
        match self.send(params).await? {
            Reply::Token(token) => Ok(token),
            Reply::OAuthError(err) => Err(AuthError::ExchangeFailed(format!(
                "refresh rejected: {err}"
            ))),
            Reply::Malformed(detail) | Reply::Failed(detail) => {
                Err(AuthError::ExchangeFailed(detail))
            }
        }
    }

    /// Poll once for the outcome of a device authorization.
    pub async fn poll_device(&self, device_code: &str) -> Result<DevicePoll> {
        let reply = self
            .send(vec![
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device_code),
            ])
            .await?;
        match reply {
            Reply::Token(token) => Ok(DevicePoll::Issued(token)),
            Reply::OAuthError(err) => Ok(match err.error.as_str() {
                "authorization_pending" => DevicePoll::Pending,
                "slow_down" => DevicePoll::SlowDown,
                _ => DevicePoll::Rejected(err),
            }),
            Reply::Malformed(detail) => Err(AuthError::Protocol(detail)),
            Reply::Failed(detail) => Err(AuthError::Denied(detail)),
        }
    }

    async fn send<'a>(&'a self, mut params: Vec<(&'a str, &'a str)>) -> Result<Reply> {
        params.push(("client_id", &self.client.client_id));
        if let Some(secret) = &self.client.client_secret {
            params.push(("client_secret", secret.expose().as_str()));
        }
        let grant = params
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map(|(_, v)| *v)
            .unwrap_or_default();

        let response = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Http(format!("token endpoint request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Http(format!("reading token endpoint response: {e}")))?;
        debug!(grant, status = status.as_u16(), "token endpoint replied");
        Ok(interpret(status, &body))
    }
}

fn interpret(status: StatusCode, body: &str) -> Reply {
    if status.is_success() {
        if let Ok(token) = serde_json::from_str::<TokenResponse>(body) {
            return Reply::Token(token);
        }
    }
    if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(body) {
        return Reply::OAuthError(err);
    }
    if status.is_success() {
        Reply::Malformed(format!("token endpoint returned {status} with an invalid body"))
    } else {
        Reply::Failed(format!("token endpoint returned {status}: {}", excerpt(body)))
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
