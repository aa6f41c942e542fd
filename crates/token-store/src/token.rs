//! Token values and the keys they are stored under

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An issued access token plus what is needed to renew it.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
/// `None` means the server never said, and the token is treated as
/// non-expiring. Values are replaced wholesale on refresh, never patched.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTokenData")]
pub struct TokenData {
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
    /// Raw OpenID Connect identity token, kept only after it validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

/// Wire shape used to route deserialization through `TokenData::new`.
#[derive(Deserialize)]
struct RawTokenData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TryFrom<RawTokenData> for TokenData {
    type Error = Error;

    fn try_from(raw: RawTokenData) -> Result<Self> {
        let token = TokenData::new(raw.access_token, raw.refresh_token, raw.expires_at)?;
        Ok(match raw.id_token {
            Some(id) => token.with_id_token(id),
            None => token,
        })
    }
}

impl TokenData {
    /// Build a token, rejecting an empty or whitespace-only access token.
    ///
    /// An empty refresh token is normalised to `None` so the lifecycle never
    /// attempts a refresh with nothing to send.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<u64>,
    ) -> Result<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(Error::InvalidToken("access token must not be empty".into()));
        }
        Ok(Self {
            access_token,
            refresh_token: refresh_token.filter(|r| !r.trim().is_empty()),
            expires_at,
            id_token: None,
        })
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref()
    }

    /// Whether the token can be used as-is at `now_millis`.
    ///
    /// A token without an expiry is always usable. Otherwise it must outlive
    /// `now + skew` so a request does not leave with a token that dies in flight.
    pub fn is_usable_at(&self, now_millis: u64, skew_millis: u64) -> bool {
        match self.expires_at {
            None => true,
            Some(expires) => expires > now_millis.saturating_add(skew_millis),
        }
    }
}

impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Identifies one stored token: a caller session and the provider it was
/// issued for. `session_id` is opaque; stores derive file names from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    session_id: String,
    provider_name: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, provider_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            provider_name: provider_name.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }
}
