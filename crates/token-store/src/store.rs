//! The persistence contract shared by every token store

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::token::{SessionKey, TokenData};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persists tokens per `(session, provider)`.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenStore>`), so providers can be handed any backend.
///
/// - `get` never fails: a missing, corrupt or undecryptable entry is a miss,
///   so callers re-authenticate instead of erroring.
/// - `save` replaces the whole entry; saving twice overwrites.
/// - `delete` of a missing key is a no-op.
///
/// Each call is atomic for its key: a concurrent reader observes either the
/// old token or the new one, never a partial write. Dropping a returned
/// future (cancellation) leaves the store consistent.
pub trait TokenStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<TokenData>>;

    fn save<'a>(&'a self, key: &'a SessionKey, token: &'a TokenData)
    -> StoreFuture<'a, Result<()>>;

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Result<()>>;
}
