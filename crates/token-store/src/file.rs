//! Plaintext JSON token files
//!
//! One file per `(session, provider)` under a root directory. Suitable when
//! the root itself is protected (a user-private directory, a mounted secret).

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::fs::{read_if_exists, remove_if_exists, write_atomic};
use crate::paths::token_path;
use crate::store::{StoreFuture, TokenStore};
use crate::token::{SessionKey, TokenData};

pub struct FileTokenStore {
    root: PathBuf,
}

impl FileTokenStore {
    /// Directories are created lazily on the first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the token for `key` lives on disk.
    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        token_path(&self.root, key)
    }
}

impl TokenStore for FileTokenStore {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<TokenData>> {
        Box::pin(async move {
            let path = self.path_for(key);
            let bytes = match read_if_exists(&path).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(e) => {
                    warn!(provider = key.provider_name(), error = %e, "token file unreadable, treating as missing");
                    return None;
                }
            };
            match serde_json::from_slice::<TokenData>(&bytes) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(provider = key.provider_name(), path = %path.display(), error = %e, "token file is corrupt, treating as missing");
                    None
                }
            }
        })
    }

    fn save<'a>(
        &'a self,
        key: &'a SessionKey,
        token: &'a TokenData,
    ) -> StoreFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_vec_pretty(token)
                .map_err(|e| Error::Serialization(format!("serializing token: {e}")))?;
            write_atomic(&self.path_for(key), &json).await
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Result<()>> {
        Box::pin(async move { remove_if_exists(&self.path_for(key)).await })
    }
}
