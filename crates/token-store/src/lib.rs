//! Token persistence for interactive authentication providers
//!
//! Tokens are stored per `(session, provider)` pair behind the `TokenStore`
//! trait, with three backends:
//!
//! - `InMemoryTokenStore` — process lifetime only
//! - `FileTokenStore` — plain JSON files, atomic temp-file + rename writes
//! - `EncryptedFileTokenStore` — same layout, ChaCha20-Poly1305 at rest with
//!   key material from a passphrase, an env var, or a generated side-car key
//!
//! Reads never fail: missing, corrupt and undecryptable entries all come back
//! as `None`, so the caller falls through to refresh or re-authentication.

pub mod crypto;
pub mod encrypted;
pub mod error;
pub mod file;
mod fs;
pub mod memory;
pub mod paths;
pub mod store;
pub mod token;

pub use crypto::{AeadProtector, KeySource, Protector};
pub use encrypted::{EncryptedFileTokenStore, EncryptedStoreOptions};
pub use error::{Error, Result};
pub use file::FileTokenStore;
pub use memory::InMemoryTokenStore;
pub use store::{StoreFuture, TokenStore};
pub use token::{SessionKey, TokenData};
