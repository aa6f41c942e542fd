//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the code verifier, the S256 challenge and the anti-forgery
//! `state` value, and assembles the authorization URL that carries them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

/// Generate a cryptographically random PKCE code verifier.
///
/// 96 random bytes encoded as URL-safe base64 (no padding) is exactly
/// 128 characters, the upper bound RFC 7636 allows.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 96];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate an unguessable `state` value for one authorization attempt.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters of one authorization-code request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: Option<&'a str>,
    pub challenge: &'a str,
    pub state: &'a str,
}

/// Build the authorization URL with all required OAuth parameters.
///
/// Query parameters already present on `endpoint` are kept.
pub fn build_authorization_url(endpoint: &str, request: &AuthorizationRequest<'_>) -> Result<String> {
    let mut url = Url::parse(endpoint).map_err(|e| {
        AuthError::Configuration(format!("invalid authorization endpoint {endpoint:?}: {e}"))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", request.client_id)
            .append_pair("redirect_uri", request.redirect_uri);
        if let Some(scope) = request.scope.filter(|s| !s.trim().is_empty()) {
            query.append_pair("scope", scope);
        }
        query
            .append_pair("code_challenge", request.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", request.state);
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn is_url_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn verifier_is_url_safe_base64_within_rfc_bounds() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 128);
        assert!(is_url_safe(&verifier), "verifier: {verifier}");
    }

    #[test]
    fn verifiers_and_states_are_unique() {
        assert_ne!(generate_verifier(), generate_verifier());
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn state_is_url_safe() {
        let state = generate_state();
        assert_eq!(state.len(), 43);
        assert!(is_url_safe(&state));
    }

    #[test]
    fn challenge_matches_known_value() {
        // SHA256("hello") = 2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
        assert_eq!(
            compute_challenge("hello"),
            "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ"
        );
    }

    #[test]
    fn challenge_decodes_to_sha256_length() {
        let challenge = compute_challenge(&generate_verifier());
        let decoded = URL_SAFE_NO_PAD.decode(&challenge).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn authorization_url_carries_encoded_params() {
        let url = build_authorization_url(
            "https://auth.example.com/authorize?audience=api",
            &AuthorizationRequest {
                client_id: "client-1",
                redirect_uri: "http://127.0.0.1:8123/callback",
                scope: Some("openid profile"),
                challenge: "chal",
                state: "st8",
            },
        )
        .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let query: HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["audience"], "api");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-1");
        assert_eq!(query["redirect_uri"], "http://127.0.0.1:8123/callback");
        assert_eq!(query["scope"], "openid profile");
        assert_eq!(query["code_challenge"], "chal");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["state"], "st8");
        assert!(!url.contains("openid profile"), "scope must be encoded: {url}");
    }

    #[test]
    fn blank_scope_is_omitted() {
        let url = build_authorization_url(
            "https://auth.example.com/authorize",
            &AuthorizationRequest {
                client_id: "c",
                redirect_uri: "http://127.0.0.1:1/cb",
                scope: Some("  "),
                challenge: "x",
                state: "y",
            },
        )
        .unwrap();
        assert!(!url.contains("scope="));
    }

    #[test]
    fn invalid_endpoint_is_configuration_error() {
        let err = build_authorization_url(
            "not a url",
            &AuthorizationRequest {
                client_id: "c",
                redirect_uri: "r",
                scope: None,
                challenge: "x",
                state: "y",
            },
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }
}
