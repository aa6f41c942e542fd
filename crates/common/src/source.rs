//! Where a configured secret comes from
//!
//! In TOML a secret is written inline, or as a reference:
//!
//! ```toml
//! password = "inline-value"
//! password = { env = "API_PASSWORD" }
//! password = { file = "/run/secrets/api-password" }
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::secret::Secret;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    Env { env: String },
    File { file: PathBuf },
    Inline(Secret<String>),
}

impl SecretSource {
    /// Read the secret. File contents are trimmed of trailing whitespace so
    /// a final newline does not end up in a header.
    pub fn resolve(&self) -> Result<Secret<String>> {
        match self {
            SecretSource::Inline(value) => Ok(value.clone()),
            SecretSource::Env { env } => std::env::var(env)
                .map(Secret::from)
                .map_err(|_| Error::MissingEnv(env.clone())),
            SecretSource::File { file } => {
                let contents = std::fs::read_to_string(file).map_err(|e| {
                    Error::Config(format!("failed to read secret file {}: {e}", file.display()))
                })?;
                Ok(Secret::from(contents.trim_end()))
            }
        }
    }
}

impl From<&str> for SecretSource {
    fn from(value: &str) -> Self {
        SecretSource::Inline(Secret::from(value))
    }
}
