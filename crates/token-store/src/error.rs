//! Error types for token persistence

/// Errors from token store operations.
///
/// `StorageUnavailable` is produced while reading protected token files
/// (decryption or parse failure). Stores recover from it locally by
/// reporting a cache miss, so it never crosses the `TokenStore::get` boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key material error: {0}")]
    KeyMaterial(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
