//! OAuth 2.0 client side: the provider contract and its implementations.
//!
//! Every external service implements [`Provider`]:
//! 1. `build_authorization_url` - fresh PKCE pair + CSRF state + URL
//! 2. `exchange_code` - authorization code + verifier → tokens
//! 3. `refresh` - refresh token → new access token
//! 4. `account_info` - access token → stable account identifier
//!
//! Providers register into a [`ProviderRegistry`] that flows, token sources
//! and the refresh scheduler look up by name.

mod dropbox;
mod exchange;
pub mod pkce;
mod provider;
mod registry;
mod state_manager;

pub use dropbox::DropboxProvider;
pub use exchange::OAuthErrorBody;
pub use pkce::Pkce;
pub use provider::{OAuth2Provider, OAuth2ProviderConfig};
pub use registry::ProviderRegistry;
pub use state_manager::{run_state_cleanup, PendingAttempt, PendingAttempts};

use crate::credentials::RefreshedToken;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Everything produced when an authorization attempt starts.
///
/// The verifier and state are single-use; they are consumed by exactly one
/// callback or manual code submission.
#[derive(Clone, Debug)]
pub struct AuthorizationRequest {
    /// Full URL the user must open
    pub url: String,
    /// CSRF state echoed back by the provider
    pub state: String,
    pub pkce: Pkce,
}

/// OAuth token response (standard OAuth 2.0, plus Dropbox's `account_id`)
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry computed from the relative `expires_in`.
    ///
    /// Fails when the lifetime does not fit in a timestamp.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let Some(seconds) = self.expires_in else {
            return Ok(None);
        };
        Duration::try_seconds(seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .map(Some)
            .ok_or_else(|| Error::InvalidTokenResponse(format!("expires_in {seconds} is out of range")))
    }

    /// Rejects responses that carry no usable access token.
    pub fn ensure_access_token(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            return Err(Error::InvalidTokenResponse("empty access_token".to_string()));
        }
        Ok(())
    }

    pub fn token_type_or_default(&self) -> String {
        self.token_type
            .clone()
            .unwrap_or_else(|| "bearer".to_string())
    }

    /// Converts a refresh response into the store's rotation input.
    pub fn into_refreshed(self, now: DateTime<Utc>) -> Result<RefreshedToken> {
        self.ensure_access_token()?;
        let expires_at = self.expires_at(now)?;
        Ok(RefreshedToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            scope: self.scope.filter(|s| !s.is_empty()),
        })
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Identity of the account a token belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Capability contract every external OAuth service implements.
///
/// Implementations are stateless apart from configuration and an HTTP
/// client; all credential state lives in the credential store.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used as the first half of the storage key.
    fn name(&self) -> &str;

    /// Generates a fresh PKCE verifier/challenge and CSRF state and embeds
    /// them (plus `redirect_url`, when given) in the authorization URL.
    /// Must request offline/refresh-capable access where supported.
    fn build_authorization_url(&self, redirect_url: Option<&str>) -> AuthorizationRequest;

    /// Trades an authorization code and verifier for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_url: Option<&str>,
    ) -> Result<TokenResponse>;

    /// Trades a refresh token for a new access token. The response may
    /// omit a refresh token, in which case the caller keeps the old one.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;

    /// Resolves the account identifier for an access token.
    async fn account_info(&self, access_token: &str) -> Result<AccountInfo>;
}
