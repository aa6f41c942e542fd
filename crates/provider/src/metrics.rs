//! Token acquisition metrics
//!
//! - `auth_token_acquisitions_total` (counter): labels `provider`, `source`
//! - `auth_refresh_fallbacks_total` (counter): label `provider`
//! - `auth_acquisition_failures_total` (counter): labels `provider`, `error`
//!
//! Emitted through the `metrics` facade; the embedding process decides which
//! recorder, if any, is installed.

/// How a token handed to `apply` was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cache,
    Refresh,
    Login,
}

impl TokenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenSource::Cache => "cache",
            TokenSource::Refresh => "refresh",
            TokenSource::Login => "login",
        }
    }
}

pub fn record_acquisition(provider: &str, source: TokenSource) {
    metrics::counter!(
        "auth_token_acquisitions_total",
        "provider" => provider.to_string(),
        "source" => source.as_str()
    )
    .increment(1);
}

pub fn record_refresh_fallback(provider: &str) {
    metrics::counter!("auth_refresh_fallbacks_total", "provider" => provider.to_string())
        .increment(1);
}

pub fn record_failure(provider: &str, error_kind: &'static str) {
    metrics::counter!(
        "auth_acquisition_failures_total",
        "provider" => provider.to_string(),
        "error" => error_kind
    )
    .increment(1);
}
