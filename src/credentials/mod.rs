//! Encrypted credential storage for OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - save / get / rotate / touch / delete  │
//! │  - Transparent encryption/decryption     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryptor                          │
//! │  - AES-256-GCM, fresh nonce per call     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       RecordStore (SQLite or memory)     │
//! │  - One row per (provider, account)       │
//! │  - Atomic upserts and updates            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tokenvault::credentials::{CredentialStore, FlowResult, KeySource};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> tokenvault::Result<()> {
//! let store = CredentialStore::open(
//!     "credentials.db",
//!     &KeySource {
//!         env_var: Some("TOKENVAULT_ENCRYPTION_KEY".to_string()),
//!         file: Some("tokenvault.key".into()),
//!         ..KeySource::default()
//!     },
//! )?;
//!
//! store.save(&FlowResult {
//!     provider: "dropbox".to_string(),
//!     account_id: "dbid:abc".to_string(),
//!     access_token: "sl.access".to_string(),
//!     refresh_token: Some("refresh".to_string()),
//!     token_type: "bearer".to_string(),
//!     expires_at: Some(Utc::now() + Duration::hours(4)),
//!     scope: "files.content.read".to_string(),
//! })?;
//!
//! for account in store.list_accounts("dropbox")? {
//!     println!("{} expires {:?}", account.account_id, account.expires_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Access and refresh tokens encrypted at rest with AES-256-GCM
//! - Each token has a unique nonce (never reused)
//! - Listing accounts never decrypts anything
//! - Every mutation is a single statement, so readers never see half a record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod backend;
mod encryption;
mod key;
mod sqlite;
mod storage;

pub use backend::{MemoryRecordStore, RecordStore, StoredRecord, TokenRotation};
pub use encryption::{Encryptor, KEY_SIZE, NONCE_SIZE};
pub use key::{decode_key, generate_key, KeySource};
pub use sqlite::SqliteRecordStore;
pub use storage::{CredentialStore, RefreshedToken};

/// Plaintext output of a completed code exchange.
///
/// Handed to the caller and, when a store is configured, persisted. Never
/// written anywhere in this form.
#[derive(Clone, PartialEq, Eq)]
pub struct FlowResult {
    pub provider: String,
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: String,
}

impl std::fmt::Debug for FlowResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowResult")
            .field("provider", &self.provider)
            .field("account_id", &self.account_id)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// A stored credential after decryption.
///
/// Lives only for the operation that loaded it (or inside a token source's
/// private cache).
#[derive(Clone)]
pub struct Credential {
    pub provider: String,
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

/// True when `expires_at` falls within `margin` of `now` (or already has
/// passed). `None` never expires; a horizon past the last representable
/// timestamp covers every expiry.
pub(crate) fn expires_within(
    expires_at: Option<DateTime<Utc>>,
    margin: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(at) = expires_at else {
        return false;
    };
    now.checked_add_signed(margin).map_or(true, |horizon| at <= horizon)
}

impl Credential {
    /// True when the token expires within `margin` of `now` (or already has).
    /// Credentials without an expiry never expire.
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        expires_within(self.expires_at, margin, now)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("account_id", &self.account_id)
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("last_used_at", &self.last_used_at)
            .field("last_refreshed_at", &self.last_refreshed_at)
            .finish()
    }
}

/// Non-secret view of a stored credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub provider: String,
    pub account_id: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: String,
    pub has_refresh_token: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl AccountSummary {
    /// See [`Credential::expires_within`].
    pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
        expires_within(self.expires_at, margin, now)
    }
}

impl From<&StoredRecord> for AccountSummary {
    fn from(record: &StoredRecord) -> Self {
        Self {
            provider: record.provider.clone(),
            account_id: record.account_id.clone(),
            token_type: record.token_type.clone(),
            expires_at: record.expires_at,
            scope: record.scope.clone(),
            has_refresh_token: record.refresh_token.is_some(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_used_at: record.last_used_at,
            last_refreshed_at: record.last_refreshed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(expires_at: Option<DateTime<Utc>>) -> Credential {
        let now = Utc::now();
        Credential {
            provider: "dropbox".to_string(),
            account_id: "dbid:1".to_string(),
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            token_type: "bearer".to_string(),
            expires_at,
            scope: String::new(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
            last_refreshed_at: None,
        }
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let margin = Duration::minutes(5);

        assert!(credential(Some(now + Duration::minutes(1))).expires_within(margin, now));
        assert!(credential(Some(now - Duration::minutes(1))).expires_within(margin, now));
        assert!(!credential(Some(now + Duration::hours(1))).expires_within(margin, now));
        assert!(!credential(None).expires_within(margin, now));
    }

    #[test]
    fn test_huge_margin_does_not_overflow() {
        let now = Utc::now();
        let margin = Duration::seconds(i64::MAX / 2000);

        assert!(credential(Some(now + Duration::days(365))).expires_within(margin, now));
        assert!(!credential(None).expires_within(margin, now));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", credential(None));
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("dbid:1"));
    }
}
