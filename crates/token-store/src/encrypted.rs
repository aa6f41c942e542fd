//! Encrypted per-session token files
//!
//! Same layout as the plain store (`<root>/<sha256(session)>/<provider>.json`),
//! but every file is passed through a `Protector` before it is written and
//! after it is read. Anything that cannot be opened (wrong key, file copied
//! from another machine, truncated write by a foreign tool) reads as a miss
//! so the caller re-authenticates; the file itself is left alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::crypto::{AeadProtector, KeySource, Protector};
use crate::error::{Error, Result};
use crate::fs::{read_if_exists, remove_if_exists, write_atomic};
use crate::paths::token_path;
use crate::store::{StoreFuture, TokenStore};
use crate::token::{SessionKey, TokenData};

/// Associated data used when the caller does not bind a context.
pub const DEFAULT_ASSOCIATED_DATA: &[u8] = b"token-store/v1";

/// How to open an encrypted store.
#[derive(Debug, Clone)]
pub struct EncryptedStoreOptions {
    pub root: PathBuf,
    pub key_source: KeySource,
    /// Authenticated context bound into every ciphertext, e.g. an application
    /// or deployment name. Files do not open under a different value.
    pub associated_data: Vec<u8>,
}

impl EncryptedStoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_source: KeySource::default(),
            associated_data: DEFAULT_ASSOCIATED_DATA.to_vec(),
        }
    }

    pub fn key_source(mut self, key_source: KeySource) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn associated_data(mut self, associated_data: impl Into<Vec<u8>>) -> Self {
        self.associated_data = associated_data.into();
        self
    }
}

pub struct EncryptedFileTokenStore {
    root: PathBuf,
    protector: Arc<dyn Protector>,
}

impl EncryptedFileTokenStore {
    /// Resolve key material and select the AEAD backend.
    ///
    /// Key material is resolved here, once; a bad passphrase source or an
    /// unreadable key file fails construction rather than every later read.
    pub fn open(options: EncryptedStoreOptions) -> Result<Self> {
        if options.root.as_os_str().is_empty() {
            return Err(Error::Io("token store root must not be empty".into()));
        }
        let key = options.key_source.resolve(&options.root)?;
        let protector = AeadProtector::new(&key, options.associated_data)?;
        Ok(Self::with_protector(options.root, Arc::new(protector)))
    }

    /// Use an explicit protection backend.
    pub fn with_protector(root: impl Into<PathBuf>, protector: Arc<dyn Protector>) -> Self {
        let root = root.into();
        info!(root = %root.display(), backend = protector.name(), "opened encrypted token store");
        Self { root, protector }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        token_path(&self.root, key)
    }

    fn decode(&self, bytes: &[u8]) -> Result<TokenData> {
        let plaintext = self.protector.unprotect(bytes)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::StorageUnavailable(format!("decrypted token is not valid: {e}")))
    }
}

impl TokenStore for EncryptedFileTokenStore {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<TokenData>> {
        Box::pin(async move {
            let path = self.path_for(key);
            let bytes = match read_if_exists(&path).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return None,
                Err(e) => {
                    warn!(provider = key.provider_name(), error = %e, "token file unreadable, treating as cache miss");
                    return None;
                }
            };
            match self.decode(&bytes) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(
                        provider = key.provider_name(),
                        path = %path.display(),
                        error = %e,
                        "could not open encrypted token, treating as cache miss"
                    );
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
            let json = serde_json::to_vec(token)
                .map_err(|e| Error::Serialization(format!("serializing token: {e}")))?;
            let payload = self.protector.protect(&json)?;
            write_atomic(&self.path_for(key), &payload).await
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Result<()>> {
        Box::pin(async move { remove_if_exists(&self.path_for(key)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;

    fn token(suffix: &str) -> TokenData {
        TokenData::new(
            format!("at_{suffix}"),
            Some(format!("rt_{suffix}")),
            Some(1_735_500_000_000),
        )
        .unwrap()
    }

    fn open(root: &Path, passphrase: &str) -> EncryptedFileTokenStore {
        EncryptedFileTokenStore::open(
            EncryptedStoreOptions::new(root)
                .key_source(KeySource::Passphrase(Secret::from(passphrase))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn roundtrip_yields_identical_token() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new("session-1", "github");
        let original = token("1").with_id_token("id_1");

        open(dir.path(), "pass").save(&key, &original).await.unwrap();
        let loaded = open(dir.path(), "pass").get(&key).await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn file_does_not_contain_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), "pass");
        let key = SessionKey::new("session-1", "github");
        store.save(&key, &token("plaintext_marker")).await.unwrap();

        let bytes = tokio::fs::read(store.path_for(&key)).await.unwrap();
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(!haystack.contains("at_plaintext_marker"));
        assert!(!haystack.contains("access_token"));
    }

    #[tokio::test]
    async fn wrong_key_reads_as_missing_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new("session-1", "github");
        let writer = open(dir.path(), "right");
        writer.save(&key, &token("1")).await.unwrap();

        let reader = open(dir.path(), "wrong");
        assert!(reader.get(&key).await.is_none());
        assert!(writer.path_for(&key).exists());
        // The rightful key still opens it.
        assert!(writer.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn corrupted_file_reads_as_missing_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), "pass");
        let key = SessionKey::new("session-1", "github");
        store.save(&key, &token("1")).await.unwrap();

        let path = store.path_for(&key);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        tokio::fs::write(&path, &bytes).await.unwrap();

        assert!(store.get(&key).await.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn different_associated_data_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new("session-1", "github");
        let passphrase = KeySource::Passphrase(Secret::from("pass"));

        let a = EncryptedFileTokenStore::open(
            EncryptedStoreOptions::new(dir.path())
                .key_source(passphrase.clone())
                .associated_data(b"app-a".to_vec()),
        )
        .unwrap();
        let b = EncryptedFileTokenStore::open(
            EncryptedStoreOptions::new(dir.path())
                .key_source(passphrase)
                .associated_data(b"app-b".to_vec()),
        )
        .unwrap();

        a.save(&key, &token("1")).await.unwrap();
        assert!(b.get(&key).await.is_none());
        assert!(a.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn sessions_never_collide_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), "pass");
        let alice = SessionKey::new("alice", "github");
        let bob = SessionKey::new("bob", "github");

        store.save(&alice, &token("alice")).await.unwrap();
        store.save(&bob, &token("bob")).await.unwrap();

        assert_ne!(store.path_for(&alice), store.path_for(&bob));
        assert_eq!(store.get(&alice).await.unwrap().access_token(), "at_alice");
        assert_eq!(store.get(&bob).await.unwrap().access_token(), "at_bob");

        store.delete(&alice).await.unwrap();
        assert!(store.get(&alice).await.is_none());
        assert!(store.get(&bob).await.is_some());
    }

    #[tokio::test]
    async fn session_directory_does_not_leak_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), "pass");
        let key = SessionKey::new("user@example.com", "github");
        store.save(&key, &token("1")).await.unwrap();

        let path = store.path_for(&key).display().to_string();
        assert!(!path.contains("user@example.com"));
    }

    #[tokio::test]
    async fn generated_key_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new("session-1", "github");
        let options = EncryptedStoreOptions::new(dir.path()).key_source(KeySource::KeyFile);

        EncryptedFileTokenStore::open(options.clone())
            .unwrap()
            .save(&key, &token("1"))
            .await
            .unwrap();

        let reopened = EncryptedFileTokenStore::open(options).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap().access_token(), "at_1");
    }

    #[test]
    fn empty_root_rejected() {
        let result = EncryptedFileTokenStore::open(EncryptedStoreOptions::new(""));
        assert!(result.is_err());
    }
}
