//! Key material and at-rest protection for encrypted token files
//!
//! Key material comes from one of three places: a passphrase handed in by the
//! caller, a passphrase in an environment variable, or a random 256-bit key
//! written once to a side-car file in the store root. Passphrases are
//! stretched to a 32-byte key with SHA-256. The key is resolved once when the
//! store is opened and lives inside the `Protector` for the store's lifetime.
//!
//! Payload format: `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext+tag`.

use std::io::{ErrorKind, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use common::Secret;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits).
pub const KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size.
const TAG_SIZE: usize = 16;

/// Side-car file holding the generated key (base64) inside the store root.
pub const KEY_FILE_NAME: &str = ".tokenstore.key";

/// Environment variable consulted by `KeySource::Auto`.
pub const DEFAULT_KEY_ENV: &str = "AUTH_TOKENSTORE_KEY";

/// Where the encryption key comes from.
#[derive(Debug, Clone, Default)]
pub enum KeySource {
    /// Caller-supplied passphrase.
    Passphrase(Secret<String>),
    /// Passphrase read from the named environment variable; it must be set.
    Environment(String),
    /// Random key persisted as `KEY_FILE_NAME` in the store root.
    KeyFile,
    /// `DEFAULT_KEY_ENV` when set and non-empty, otherwise `KeyFile`.
    #[default]
    Auto,
}

impl KeySource {
    /// Resolve to raw key bytes. May create the key file under `root`.
    pub fn resolve(&self, root: &Path) -> Result<Secret<[u8; KEY_SIZE]>> {
        match self {
            KeySource::Passphrase(passphrase) => derive_from_passphrase(passphrase),
            KeySource::Environment(var) => {
                let value = std::env::var(var).map_err(|_| {
                    Error::KeyMaterial(format!("environment variable {var} is not set"))
                })?;
                derive_from_passphrase(&Secret::new(value))
            }
            KeySource::KeyFile => load_or_create_key_file(root),
            KeySource::Auto => match std::env::var(DEFAULT_KEY_ENV) {
                Ok(value) if !value.trim().is_empty() => {
                    debug!(var = DEFAULT_KEY_ENV, "using token store key from environment");
                    derive_from_passphrase(&Secret::new(value))
                }
                _ => load_or_create_key_file(root),
            },
        }
    }
}

fn derive_from_passphrase(passphrase: &Secret<String>) -> Result<Secret<[u8; KEY_SIZE]>> {
    if passphrase.is_blank() {
        return Err(Error::KeyMaterial("passphrase must not be empty".into()));
    }
    let digest = Sha256::digest(passphrase.expose().as_bytes());
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest);
    Ok(Secret::new(key))
}

/// Generate a random 256-bit key.
pub fn generate_key() -> Secret<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill(&mut key);
    Secret::new(key)
}

/// Read the side-car key, creating it on first use.
///
/// Creation uses `create_new`, so two stores opening the same root at once
/// agree on whichever key landed first.
fn load_or_create_key_file(root: &Path) -> Result<Secret<[u8; KEY_SIZE]>> {
    let path = root.join(KEY_FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(raw) => return decode_key(raw.trim()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::KeyMaterial(format!(
                "reading key file {}: {e}",
                path.display()
            )));
        }
    }

    std::fs::create_dir_all(root)
        .map_err(|e| Error::KeyMaterial(format!("creating store root {}: {e}", root.display())))?;

    let key = generate_key();
    let encoded = Secret::new(STANDARD.encode(key.expose()));

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    match options.open(&path) {
        Ok(mut file) => {
            file.write_all(encoded.expose().as_bytes())
                .map_err(|e| Error::KeyMaterial(format!("writing key file: {e}")))?;
            info!(path = %path.display(), "generated token store key");
            Ok(key)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::KeyMaterial(format!("reading key file: {e}")))?;
            decode_key(raw.trim())
        }
        Err(e) => Err(Error::KeyMaterial(format!(
            "creating key file {}: {e}",
            path.display()
        ))),
    }
}

fn decode_key(encoded: &str) -> Result<Secret<[u8; KEY_SIZE]>> {
    let bytes = Secret::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::KeyMaterial(format!("key file is not base64: {e}")))?,
    );
    if bytes.expose().len() != KEY_SIZE {
        return Err(Error::KeyMaterial(format!(
            "key file holds {} bytes, expected {KEY_SIZE}",
            bytes.expose().len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(bytes.expose());
    Ok(Secret::new(key))
}

/// Encrypts token payloads before they touch disk.
///
/// Chosen once when a store is opened. A platform keystore backend plugs in
/// here without touching the store's read/write path.
pub trait Protector: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails with `StorageUnavailable` for wrong keys and damaged payloads.
    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 with a random nonce per write.
///
/// `associated_data` is authenticated but not stored; payloads written under
/// one context fail to open under another.
pub struct AeadProtector {
    cipher: ChaCha20Poly1305,
    associated_data: Vec<u8>,
}

impl AeadProtector {
    pub fn new(key: &Secret<[u8; KEY_SIZE]>, associated_data: impl Into<Vec<u8>>) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose())
            .map_err(|e| Error::KeyMaterial(e.to_string()))?;
        Ok(Self {
            cipher,
            associated_data: associated_data.into(),
        })
    }
}

impl Protector for AeadProtector {
    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.associated_data,
                },
            )
            .map_err(|e| Error::Serialization(format!("encrypting token: {e}")))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::StorageUnavailable(format!(
                "payload is {} bytes, too short to hold a nonce and tag",
                payload.len()
            )));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &self.associated_data,
                },
            )
            .map_err(|_| {
                Error::StorageUnavailable(
                    "decryption failed (wrong key, different context, or damaged file)".into(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protector(passphrase: &str, context: &[u8]) -> AeadProtector {
        let key = KeySource::Passphrase(Secret::from(passphrase))
            .resolve(Path::new("/unused"))
            .unwrap();
        AeadProtector::new(&key, context.to_vec()).unwrap()
    }

    #[test]
    fn roundtrip() {
        let p = protector("correct horse", b"ctx");
        let payload = p.protect(b"{\"access_token\":\"at\"}").unwrap();
        assert_eq!(p.unprotect(&payload).unwrap(), b"{\"access_token\":\"at\"}");
    }

    #[test]
    fn payload_is_nonce_prefixed_and_fresh_each_time() {
        let p = protector("correct horse", b"ctx");
        let a = p.protect(b"same").unwrap();
        let b = p.protect(b"same").unwrap();
        assert_eq!(a.len(), NONCE_SIZE + 4 + TAG_SIZE);
        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_is_storage_unavailable() {
        let payload = protector("one", b"ctx").protect(b"secret").unwrap();
        let err = protector("two", b"ctx").unprotect(&payload).unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }

    #[test]
    fn different_context_fails() {
        let payload = protector("same", b"deployment-a").protect(b"secret").unwrap();
        assert!(protector("same", b"deployment-b").unprotect(&payload).is_err());
    }

    #[test]
    fn truncated_payload_fails() {
        let p = protector("same", b"ctx");
        assert!(matches!(
            p.unprotect(&[0u8; 5]).unwrap_err(),
            Error::StorageUnavailable(_)
        ));
    }

    #[test]
    fn blank_passphrase_rejected() {
        let result = KeySource::Passphrase(Secret::from("  ")).resolve(Path::new("/unused"));
        assert!(matches!(result, Err(Error::KeyMaterial(_))));
    }

    #[test]
    fn missing_environment_variable_rejected() {
        let result = KeySource::Environment("TOKEN_STORE_TEST_UNSET_VAR".into())
            .resolve(Path::new("/unused"));
        assert!(matches!(result, Err(Error::KeyMaterial(_))));
    }

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = KeySource::KeyFile.resolve(dir.path()).unwrap();
        let second = KeySource::KeyFile.resolve(dir.path()).unwrap();
        assert_eq!(first.expose(), second.expose());

        let raw = std::fs::read_to_string(dir.path().join(KEY_FILE_NAME)).unwrap();
        assert_eq!(STANDARD.decode(raw.trim()).unwrap().len(), KEY_SIZE);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        KeySource::KeyFile.resolve(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join(KEY_FILE_NAME))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600, "key file must be 0600, got {mode:o}");
    }

    #[test]
    fn malformed_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_FILE_NAME), "c2hvcnQ=").unwrap();
        assert!(matches!(
            KeySource::KeyFile.resolve(dir.path()),
            Err(Error::KeyMaterial(_))
        ));
    }
}
