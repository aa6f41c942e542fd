//! Token lifecycle for interactive providers
//!
//! On every request:
//! 1. stored token that outlives `now + 60s` (or has no expiry): use it
//! 2. otherwise, with a refresh token: exactly one refresh exchange
//! 3. no refresh token, or the refresh failed for any reason: run the full
//!    interactive flow once
//!
//! Steps 2 and 3 run under a per-`SessionKey` lease, and the store is read
//! again once the lease is held, so callers that queued behind a login reuse
//! its result instead of starting their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use oauth_flows::{
    AuthError, AuthorizationCodeFlow, Clock, DeviceCodeFlow, Result, SystemClock, TokenEndpoint,
    cancellable,
};
use token_store::{SessionKey, TokenData, TokenStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{self, TokenSource};

/// Tokens closer than this to expiry are treated as expired.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// The interactive grant behind a provider.
pub enum InteractiveFlow {
    DeviceCode(DeviceCodeFlow),
    AuthorizationCode(AuthorizationCodeFlow),
}

impl InteractiveFlow {
    pub fn endpoint(&self) -> &TokenEndpoint {
        match self {
            InteractiveFlow::DeviceCode(flow) => flow.endpoint(),
            InteractiveFlow::AuthorizationCode(flow) => flow.endpoint(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InteractiveFlow::DeviceCode(_) => "device_code",
            InteractiveFlow::AuthorizationCode(_) => "authorization_code",
        }
    }

    async fn login(&self, cancel: &CancellationToken) -> Result<TokenData> {
        match self {
            InteractiveFlow::DeviceCode(flow) => flow.run(cancel).await,
            InteractiveFlow::AuthorizationCode(flow) => flow.run(cancel).await,
        }
    }
}

type Lease = tokio::sync::Mutex<()>;

pub struct TokenLifecycle {
    provider_name: String,
    flow: InteractiveFlow,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    refresh_scope: Option<String>,
    leases: Mutex<HashMap<SessionKey, Weak<Lease>>>,
}

impl TokenLifecycle {
    pub fn new(
        provider_name: impl Into<String>,
        flow: InteractiveFlow,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        let provider_name = provider_name.into();
        if provider_name.trim().is_empty() {
            return Err(AuthError::Configuration("provider name must not be empty".into()));
        }
        Ok(Self {
            provider_name,
            flow,
            store,
            clock: Arc::new(SystemClock),
            refresh_scope: None,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scope sent with refresh requests; omitted when `None`.
    pub fn with_refresh_scope(mut self, scope: Option<String>) -> Self {
        self.refresh_scope = scope;
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn flow(&self) -> &InteractiveFlow {
        &self.flow
    }

    /// A usable access token for `session_id`.
    pub async fn token(&self, session_id: &str, cancel: &CancellationToken) -> Result<TokenData> {
        let key = SessionKey::new(session_id, &self.provider_name);
        let result = self.acquire(&key, cancel).await;
        if let Err(e) = &result {
            metrics::record_failure(&self.provider_name, e.kind());
            warn!(
                provider = %self.provider_name,
                flow = self.flow.kind(),
                error = %e,
                "could not obtain a token"
            );
        }
        result
    }

    /// Forget the stored token for `session_id`.
    pub async fn sign_out(&self, session_id: &str) -> token_store::Result<()> {
        let key = SessionKey::new(session_id, &self.provider_name);
        self.store.delete(&key).await?;
        info!(provider = %self.provider_name, "signed out");
        Ok(())
    }

    async fn acquire(&self, key: &SessionKey, cancel: &CancellationToken) -> Result<TokenData> {
        if let Some(token) = self.usable(cancellable(cancel, self.store.get(key)).await?) {
            metrics::record_acquisition(&self.provider_name, TokenSource::Cache);
            return Ok(token);
        }

        let lease = self.lease(key);
        let _held = cancellable(cancel, lease.lock()).await?;

        let current = cancellable(cancel, self.store.get(key)).await?;
        let previous_refresh = current
            .as_ref()
            .and_then(|t| t.refresh_token())
            .map(str::to_owned);
        if let Some(token) = self.usable(current) {
            debug!(provider = %self.provider_name, "token obtained by a concurrent caller");
            metrics::record_acquisition(&self.provider_name, TokenSource::Cache);
            return Ok(token);
        }

        if let Some(refresh) = previous_refresh {
            match self.refresh(&refresh, cancel).await {
                Ok(token) => {
                    self.persist(key, &token, cancel).await?;
                    info!(provider = %self.provider_name, "token refreshed");
                    metrics::record_acquisition(&self.provider_name, TokenSource::Refresh);
                    return Ok(token);
                }
                Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
                Err(e) => {
                    warn!(
                        provider = %self.provider_name,
                        error = %e,
                        "token refresh failed, falling back to interactive login"
                    );
                    metrics::record_refresh_fallback(&self.provider_name);
                }
            }
        }

        info!(provider = %self.provider_name, flow = self.flow.kind(), "starting interactive login");
        let token = self.flow.login(cancel).await?;
        self.persist(key, &token, cancel).await?;
        metrics::record_acquisition(&self.provider_name, TokenSource::Login);
        Ok(token)
    }

    fn usable(&self, token: Option<TokenData>) -> Option<TokenData> {
        let now = self.clock.now_millis();
        token.filter(|t| t.is_usable_at(now, EXPIRY_SKEW.as_millis() as u64))
    }

    async fn refresh(&self, refresh_token: &str, cancel: &CancellationToken) -> Result<TokenData> {
        let response = cancellable(
            cancel,
            self.flow
                .endpoint()
                .refresh(refresh_token, self.refresh_scope.as_deref()),
        )
        .await??;
        response.into_token_data(self.clock.now_millis(), Some(refresh_token))
    }

    /// Save failures do not fail the request; the token is still used.
    async fn persist(
        &self,
        key: &SessionKey,
        token: &TokenData,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Err(e) = cancellable(cancel, self.store.save(key, token)).await? {
            warn!(
                provider = %self.provider_name,
                error = %e,
                "failed to persist token, continuing with in-memory token"
            );
        }
        Ok(())
    }

    fn lease(&self, key: &SessionKey) -> Arc<Lease> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = leases.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        leases.retain(|_, lease| lease.strong_count() > 0);
        let lease = Arc::new(Lease::new(()));
        leases.insert(key.clone(), Arc::downgrade(&lease));
        lease
    }
}
