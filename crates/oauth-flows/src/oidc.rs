//! OpenID Connect ID token validation
//!
//! Verifies the signature of an `id_token` against the issuer's JWKS and
//! checks `iss`, `aud` and `exp`. The key set is cached and fetched again
//! only when a token names a key id the cache does not know.
//!
//! Accepted algorithms come from the selected key (its `alg`, or its key
//! family when `alg` is absent), never from the token header.

use std::str::FromStr;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AuthError, Result};

/// Where and how to validate ID tokens for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OidcConfig {
    pub issuer: String,
    pub jwks_uri: String,
    /// Expected `aud`; defaults to the client id.
    #[serde(default)]
    pub audience: Option<String>,
}

/// Claims extracted from a validated ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

pub struct IdTokenValidator {
    http: reqwest::Client,
    issuer: String,
    audience: String,
    jwks_uri: String,
    keys: RwLock<Option<JwkSet>>,
}

impl IdTokenValidator {
    pub fn new(http: reqwest::Client, config: OidcConfig, client_id: &str) -> Result<Self> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError::Configuration("OIDC issuer must not be empty".into()));
        }
        reqwest::Url::parse(&config.jwks_uri).map_err(|e| {
            AuthError::Configuration(format!("invalid jwks_uri {:?}: {e}", config.jwks_uri))
        })?;
        Ok(Self {
            http,
            issuer: config.issuer,
            audience: config.audience.unwrap_or_else(|| client_id.to_string()),
            jwks_uri: config.jwks_uri,
            keys: RwLock::new(None),
        })
    }

    /// Validate `id_token`, returning its claims.
    ///
    /// Failures are reported as `ExchangeFailed`: a token response whose ID
    /// token does not verify is not a usable response.
    pub async fn validate(&self, id_token: &str) -> Result<IdTokenClaims> {
        let header = decode_header(id_token)
            .map_err(|e| AuthError::ExchangeFailed(format!("malformed id_token: {e}")))?;
        let key = self.signing_key(header.kid.as_deref()).await?;
        if !key.algorithms.contains(&header.alg) {
            return Err(AuthError::ExchangeFailed(format!(
                "id_token algorithm {:?} does not match the signing key",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.algorithms = key.algorithms;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let data = decode::<IdTokenClaims>(id_token, &key.decoding, &validation)
            .map_err(|e| AuthError::ExchangeFailed(format!("id_token rejected: {e}")))?;
        debug!(sub = %data.claims.sub, "id_token validated");
        Ok(data.claims)
    }

    async fn signing_key(&self, kid: Option<&str>) -> Result<SigningKey> {
        if let Some(set) = self.keys.read().await.as_ref() {
            if let Some(key) = select_key(set, kid)? {
                return Ok(key);
            }
        }

        let set = self.fetch_keys().await?;
        let key = select_key(&set, kid)?.ok_or_else(|| {
            AuthError::ExchangeFailed(format!("no signing key matches kid {kid:?}"))
        })?;
        *self.keys.write().await = Some(set);
        Ok(key)
    }

    async fn fetch_keys(&self) -> Result<JwkSet> {
        debug!(jwks_uri = %self.jwks_uri, "fetching signing keys");
        let response = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| AuthError::ExchangeFailed(format!("fetching JWKS failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::ExchangeFailed(format!(
                "JWKS endpoint returned {status}"
            )));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::ExchangeFailed(format!("invalid JWKS document: {e}")))
    }
}

struct SigningKey {
    decoding: DecodingKey,
    algorithms: Vec<Algorithm>,
}

fn select_key(set: &JwkSet, kid: Option<&str>) -> Result<Option<SigningKey>> {
    let jwk = match kid {
        Some(kid) => set.find(kid),
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    };
    jwk.map(|jwk| {
        let decoding = DecodingKey::from_jwk(jwk)
            .map_err(|e| AuthError::ExchangeFailed(format!("unusable signing key: {e}")))?;
        Ok(SigningKey {
            decoding,
            algorithms: key_algorithms(jwk)?,
        })
    })
    .transpose()
}

fn key_algorithms(jwk: &Jwk) -> Result<Vec<Algorithm>> {
    if let Some(alg) = jwk.common.key_algorithm {
        let alg = Algorithm::from_str(&alg.to_string()).map_err(|_| {
            AuthError::ExchangeFailed(format!(
                "signing key algorithm {alg} cannot verify signatures"
            ))
        })?;
        return Ok(vec![alg]);
    }
    Ok(match &jwk.algorithm {
        AlgorithmParameters::RSA(_) => vec![
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::PS256,
            Algorithm::PS384,
            Algorithm::PS512,
        ],
        AlgorithmParameters::EllipticCurve(_) => vec![Algorithm::ES256, Algorithm::ES384],
        AlgorithmParameters::OctetKey(_) => {
            vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]
        }
        AlgorithmParameters::OctetKeyPair(_) => vec![Algorithm::EdDSA],
    })
}
