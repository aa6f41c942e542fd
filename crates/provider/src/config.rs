//! Provider configuration
//!
//! One provider per target API, described in TOML:
//!
//! ```toml
//! name = "github"
//!
//! [auth]
//! type = "device_code"
//! client_id = "Iv1.abc"
//! token_endpoint = "https://github.com/login/oauth/access_token"
//! device_authorization_endpoint = "https://github.com/login/device/code"
//! scope = "repo"
//! ```
//!
//! Secrets accept `common::SecretSource` (inline, `{ env = ".." }` or
//! `{ file = ".." }`) and are resolved when the provider is built.

use std::sync::Arc;
use std::time::Duration;

use common::{Secret, SecretSource};
use oauth_flows::authorization_code::{DEFAULT_LOGIN_TIMEOUT, DEFAULT_REDIRECT_PATH};
use oauth_flows::{
    AuthError, AuthorizationCodeConfig, AuthorizationCodeFlow, ClientCredentials,
    DeviceCodeFlow, DevicePrompt, IdTokenValidator, OidcConfig, OpenUrl, Result, TokenEndpoint,
};
use serde::Deserialize;
use token_store::TokenStore;

use crate::lifecycle::{InteractiveFlow, TokenLifecycle};
use crate::static_auth::{ApiKeyLocation, ApiKeyProvider, BasicProvider, BearerProvider};
use crate::AuthenticationProvider;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Names the provider in token file names, logs and metrics.
    pub name: String,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    ApiKey {
        parameter: String,
        value: SecretSource,
        #[serde(default)]
        location: ApiKeyLocation,
    },
    Basic {
        username: String,
        password: SecretSource,
    },
    Bearer {
        token: SecretSource,
    },
    DeviceCode {
        client_id: String,
        #[serde(default)]
        client_secret: Option<SecretSource>,
        token_endpoint: String,
        device_authorization_endpoint: String,
        #[serde(default)]
        scope: Option<String>,
    },
    AuthorizationCode {
        client_id: String,
        #[serde(default)]
        client_secret: Option<SecretSource>,
        token_endpoint: String,
        authorization_endpoint: String,
        #[serde(default)]
        scope: Option<String>,
        /// Loopback port for the redirect; 0 lets the OS choose.
        #[serde(default)]
        redirect_port: u16,
        #[serde(default = "default_redirect_path")]
        redirect_path: String,
        #[serde(default = "default_login_timeout_secs")]
        login_timeout_secs: u64,
        #[serde(default)]
        oidc: Option<OidcConfig>,
    },
}

fn default_redirect_path() -> String {
    DEFAULT_REDIRECT_PATH.to_string()
}

fn default_login_timeout_secs() -> u64 {
    DEFAULT_LOGIN_TIMEOUT.as_secs()
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::ApiKey { .. } => "api_key",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::DeviceCode { .. } => "device_code",
            AuthConfig::AuthorizationCode { .. } => "authorization_code",
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            AuthConfig::DeviceCode { .. } | AuthConfig::AuthorizationCode { .. }
        )
    }
}

/// Collaborators the interactive providers need; static providers ignore it.
#[derive(Clone)]
pub struct ProviderContext {
    pub http: reqwest::Client,
    pub store: Arc<dyn TokenStore>,
    pub device_prompt: DevicePrompt,
    pub open_url: OpenUrl,
}

fn resolve(source: &SecretSource, what: &str) -> Result<Secret<String>> {
    source
        .resolve()
        .map_err(|e| AuthError::Configuration(format!("{what}: {e}")))
}

fn client_credentials(client_id: &str, secret: Option<&SecretSource>) -> Result<ClientCredentials> {
    Ok(ClientCredentials {
        client_id: client_id.to_string(),
        client_secret: secret.map(|s| resolve(s, "client_secret")).transpose()?,
    })
}

impl AuthenticationProvider {
    /// Build the provider `config` describes, resolving its secrets.
    pub fn from_config(config: &ProviderConfig, context: &ProviderContext) -> Result<Self> {
        match &config.auth {
            AuthConfig::ApiKey {
                parameter,
                value,
                location,
            } => Ok(AuthenticationProvider::ApiKey(ApiKeyProvider::new(
                parameter.as_str(),
                resolve(value, "api key value")?,
                *location,
            )?)),
            AuthConfig::Basic { username, password } => Ok(AuthenticationProvider::Basic(
                BasicProvider::new(username, resolve(password, "basic auth password")?)?,
            )),
            AuthConfig::Bearer { token } => Ok(AuthenticationProvider::Bearer(
                BearerProvider::new(resolve(token, "bearer token")?)?,
            )),
            AuthConfig::DeviceCode {
                client_id,
                client_secret,
                token_endpoint,
                device_authorization_endpoint,
                scope,
            } => {
                let endpoint = TokenEndpoint::new(
                    context.http.clone(),
                    token_endpoint.as_str(),
                    client_credentials(client_id, client_secret.as_ref())?,
                )?;
                let flow = DeviceCodeFlow::new(
                    endpoint,
                    device_authorization_endpoint.as_str(),
                    scope.clone(),
                    context.device_prompt.clone(),
                )?;
                let lifecycle = TokenLifecycle::new(
                    config.name.as_str(),
                    InteractiveFlow::DeviceCode(flow),
                    context.store.clone(),
                )?
                .with_refresh_scope(scope.clone());
                Ok(AuthenticationProvider::DeviceCode(lifecycle))
            }
            AuthConfig::AuthorizationCode {
                client_id,
                client_secret,
                token_endpoint,
                authorization_endpoint,
                scope,
                redirect_port,
                redirect_path,
                login_timeout_secs,
                oidc,
            } => {
                let endpoint = TokenEndpoint::new(
                    context.http.clone(),
                    token_endpoint.as_str(),
                    client_credentials(client_id, client_secret.as_ref())?,
                )?;
                let flow_config = AuthorizationCodeConfig {
                    authorization_endpoint: authorization_endpoint.clone(),
                    scope: scope.clone(),
                    redirect_port: *redirect_port,
                    redirect_path: redirect_path.clone(),
                    timeout: Duration::from_secs(*login_timeout_secs),
                };
                let mut flow =
                    AuthorizationCodeFlow::new(endpoint, flow_config, context.open_url.clone())?;
                if let Some(oidc) = oidc {
                    flow = flow.with_id_token_validation(IdTokenValidator::new(
                        context.http.clone(),
                        oidc.clone(),
                        client_id,
                    )?);
                }
                let lifecycle = TokenLifecycle::new(
                    config.name.as_str(),
                    InteractiveFlow::AuthorizationCode(flow),
                    context.store.clone(),
                )?
                .with_refresh_scope(scope.clone());
                Ok(AuthenticationProvider::AuthorizationCode(lifecycle))
            }
        }
    }
}
