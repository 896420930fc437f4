//! Token sources: always hand out a currently valid access token.
//!
//! [`TokenSource`] serves one (provider, account) pair. Its cache sits behind
//! a single async mutex, so concurrent callers that find the token expiring
//! wait for one refresh and reuse its result instead of refreshing again.
//!
//! [`StaticTokenSource`] wraps a token supplied from outside (pasted by the
//! user, say). It never expires and cannot be refreshed.

use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::oauth::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Default window before expiry in which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN: std::time::Duration = std::time::Duration::from_secs(5 * 60);

#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A token that is not within the refresh margin of expiry.
    async fn token(&self) -> Result<String>;

    /// Refreshes regardless of expiry and returns the new token.
    async fn force_refresh(&self) -> Result<String>;

    /// Whether a usable token is available without a network round-trip.
    async fn is_valid(&self) -> bool;
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        !crate::credentials::expires_within(self.expires_at, margin, now)
    }
}

impl From<&Credential> for CachedToken {
    fn from(credential: &Credential) -> Self {
        Self {
            access_token: credential.access_token.clone(),
            expires_at: credential.expires_at,
        }
    }
}

pub struct TokenSource {
    provider: Arc<dyn Provider>,
    store: Arc<CredentialStore>,
    account_id: String,
    margin: Duration,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<CredentialStore>, account_id: impl Into<String>) -> Self {
        Self {
            provider,
            store,
            account_id: account_id.into(),
            margin: Duration::seconds(DEFAULT_REFRESH_MARGIN.as_secs() as i64),
            cache: Mutex::new(None),
        }
    }

    pub fn with_margin(mut self, margin: std::time::Duration) -> Self {
        self.margin = Duration::from_std(margin).unwrap_or(self.margin);
        self
    }

    pub fn provider(&self) -> &str {
        self.provider.name()
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    fn expired(&self) -> Error {
        Error::TokenExpired {
            provider: self.provider.name().to_string(),
            account: self.account_id.clone(),
        }
    }

    /// Best effort; a failed timestamp update never fails the caller.
    fn touch(&self) {
        if let Err(e) = self.store.touch(self.provider.name(), &self.account_id) {
            debug!(
                provider = %self.provider.name(),
                account = %self.account_id,
                error = %e,
                "Failed to update last-used timestamp"
            );
        }
    }

    async fn refresh_locked(
        &self,
        cache: &mut MutexGuard<'_, Option<CachedToken>>,
        refresh_token: &str,
    ) -> Result<String> {
        let provider = self.provider.name();
        debug!(provider = %provider, account = %self.account_id, "Refreshing access token");

        let response = match self.provider.refresh(refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                **cache = None;
                if e.is_invalid_grant() {
                    warn!(
                        provider = %provider,
                        account = %self.account_id,
                        "Refresh token rejected; re-authorization required"
                    );
                }
                return Err(e);
            }
        };

        let refreshed = match response.into_refreshed(Utc::now()) {
            Ok(refreshed) => refreshed,
            Err(e) => {
                **cache = None;
                return Err(e);
            }
        };
        self.store
            .update_after_refresh(provider, &self.account_id, &refreshed)?;

        info!(
            provider = %provider,
            account = %self.account_id,
            expires_at = ?refreshed.expires_at,
            "Access token refreshed"
        );

        **cache = Some(CachedToken {
            access_token: refreshed.access_token.clone(),
            expires_at: refreshed.expires_at,
        });
        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl AccessTokenSource for TokenSource {
    async fn token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        let now = Utc::now();

        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(self.margin, now)) {
            let token = cached.access_token.clone();
            drop(cache);
            self.touch();
            return Ok(token);
        }

        // Another source or the scheduler may have refreshed it already
        let credential = self.store.require(self.provider.name(), &self.account_id)?;
        if !credential.expires_within(self.margin, now) {
            *cache = Some(CachedToken::from(&credential));
            drop(cache);
            self.touch();
            return Ok(credential.access_token);
        }

        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            *cache = None;
            return Err(self.expired());
        };

        let token = self.refresh_locked(&mut cache, refresh_token).await?;
        drop(cache);
        self.touch();
        Ok(token)
    }

    async fn force_refresh(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        let credential = self.store.require(self.provider.name(), &self.account_id)?;
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            return Err(Error::RefreshUnsupported);
        };

        let token = self.refresh_locked(&mut cache, refresh_token).await?;
        drop(cache);
        self.touch();
        Ok(token)
    }

    async fn is_valid(&self) -> bool {
        let cache = self.cache.lock().await;
        let now = Utc::now();
        if cache.as_ref().is_some_and(|c| c.is_fresh(self.margin, now)) {
            return true;
        }
        matches!(
            self.store.get(self.provider.name(), &self.account_id),
            Ok(Some(credential)) if !credential.expires_within(self.margin, now)
        )
    }
}

/// Fixed token supplied from outside; no expiry, no refresh.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenSource")
            .field("empty", &self.token.is_empty())
            .finish()
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        if self.token.is_empty() {
            return Err(Error::Config("static token is empty".to_string()));
        }
        Ok(self.token.clone())
    }

    async fn force_refresh(&self) -> Result<String> {
        Err(Error::RefreshUnsupported)
    }

    async fn is_valid(&self) -> bool {
        !self.token.is_empty()
    }
}
