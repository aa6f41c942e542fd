//! Static credential schemes: API key, HTTP Basic, static bearer token
//!
//! All validation happens at construction, so `apply` cannot fail. Header
//! values are marked sensitive so `Debug` output of the request hides them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use oauth_flows::{AuthError, Result};
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use serde::Deserialize;

/// Where an API key travels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

#[derive(Debug, Clone)]
enum ApiKeyTarget {
    Header(HeaderName, HeaderValue),
    Query(String, Secret<String>),
}

#[derive(Debug, Clone)]
pub struct ApiKeyProvider {
    target: ApiKeyTarget,
}

impl ApiKeyProvider {
    pub fn new(
        parameter_name: impl Into<String>,
        value: Secret<String>,
        location: ApiKeyLocation,
    ) -> Result<Self> {
        let parameter_name = parameter_name.into();
        if parameter_name.trim().is_empty() {
            return Err(AuthError::Configuration(
                "API key parameter name must not be empty".into(),
            ));
        }
        if value.is_blank() {
            return Err(AuthError::Configuration(format!(
                "API key value for {parameter_name:?} must not be empty"
            )));
        }
        let target = match location {
            ApiKeyLocation::Header => {
                let name = HeaderName::from_bytes(parameter_name.as_bytes()).map_err(|e| {
                    AuthError::Configuration(format!("invalid header name {parameter_name:?}: {e}"))
                })?;
                ApiKeyTarget::Header(name, sensitive_value(value.expose())?)
            }
            ApiKeyLocation::Query => ApiKeyTarget::Query(parameter_name, value),
        };
        Ok(Self { target })
    }

    pub fn apply(&self, request: &mut reqwest::Request) {
        match &self.target {
            ApiKeyTarget::Header(name, value) => {
                request.headers_mut().insert(name.clone(), value.clone());
            }
            ApiKeyTarget::Query(name, value) => {
                let url = request.url_mut();
                // Trailing separators would otherwise leave an empty pair.
                if let Some(query) = url.query().filter(|q| q.ends_with('&')) {
                    let trimmed = query.trim_end_matches('&').to_owned();
                    url.set_query(Some(&trimmed));
                }
                url.query_pairs_mut().append_pair(name, value.expose());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicProvider {
    header: HeaderValue,
}

impl BasicProvider {
    pub fn new(username: &str, password: Secret<String>) -> Result<Self> {
        if username.is_empty() {
            return Err(AuthError::Configuration(
                "basic auth username must not be empty".into(),
            ));
        }
        if username.contains(':') {
            return Err(AuthError::Configuration(
                "basic auth username must not contain ':'".into(),
            ));
        }
        if password.expose().is_empty() {
            return Err(AuthError::Configuration(
                "basic auth password must not be empty".into(),
            ));
        }
        let credentials = Secret::from(format!("{username}:{}", password.expose()));
        let encoded = Secret::from(STANDARD.encode(credentials.expose()));
        let header = sensitive_value(&format!("Basic {}", encoded.expose()))?;
        Ok(Self { header })
    }

    pub fn apply(&self, request: &mut reqwest::Request) {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
    }
}

#[derive(Debug, Clone)]
pub struct BearerProvider {
    header: HeaderValue,
}

impl BearerProvider {
    pub fn new(token: Secret<String>) -> Result<Self> {
        if token.is_blank() {
            return Err(AuthError::Configuration(
                "bearer token must not be empty".into(),
            ));
        }
        Ok(Self {
            header: bearer_header(token.expose())?,
        })
    }

    pub fn apply(&self, request: &mut reqwest::Request) {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
    }
}

/// `Authorization: Bearer <token>`, marked sensitive.
pub(crate) fn bearer_header(token: &str) -> Result<HeaderValue> {
    sensitive_value(&format!("Bearer {token}"))
}

fn sensitive_value(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        AuthError::Configuration("credential contains characters not allowed in a header".into())
    })?;
    header.set_sensitive(true);
    Ok(header)
}
