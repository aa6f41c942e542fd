//! Process-lifetime token store

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::{StoreFuture, TokenStore};
use crate::token::{SessionKey, TokenData};

/// Keeps tokens in memory, keyed by session and provider.
///
/// Nothing survives a restart; suited to tests and short-lived processes.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<SessionKey, TokenData>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TokenStore for InMemoryTokenStore {
    fn get<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Option<TokenData>> {
        Box::pin(async move { self.tokens.read().await.get(key).cloned() })
    }

    fn save<'a>(
        &'a self,
        key: &'a SessionKey,
        token: &'a TokenData,
    ) -> StoreFuture<'a, Result<()>> {
        Box::pin(async move {
            self.tokens.write().await.insert(key.clone(), token.clone());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a SessionKey) -> StoreFuture<'a, Result<()>> {
        Box::pin(async move {
            self.tokens.write().await.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(suffix: &str) -> TokenData {
        TokenData::new(format!("at_{suffix}"), Some(format!("rt_{suffix}")), Some(1)).unwrap()
    }

    #[tokio::test]
    async fn save_get_delete() {
        let store = InMemoryTokenStore::new();
        let key = SessionKey::new("s1", "github");

        assert!(store.get(&key).await.is_none());
        store.save(&key, &token("1")).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().access_token(), "at_1");

        store.save(&key, &token("2")).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().access_token(), "at_2");
        assert_eq!(store.len().await, 1);

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = InMemoryTokenStore::new();
        let alice = SessionKey::new("alice", "github");
        let bob = SessionKey::new("bob", "github");

        store.save(&alice, &token("alice")).await.unwrap();
        store.save(&bob, &token("bob")).await.unwrap();

        assert_eq!(store.get(&alice).await.unwrap().access_token(), "at_alice");
        assert_eq!(store.get(&bob).await.unwrap().access_token(), "at_bob");
    }
}
