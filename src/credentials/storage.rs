//! Encrypting credential store.
//!
//! Wraps a [`RecordStore`] so that token fields are encrypted before every
//! write and decrypted after every read. Plaintext never reaches the backend.

use super::backend::{MemoryRecordStore, RecordStore, StoredRecord, TokenRotation};
use super::encryption::Encryptor;
use super::key::KeySource;
use super::sqlite::SqliteRecordStore;
use super::{AccountSummary, Credential, FlowResult};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

/// Plaintext result of a refresh, applied with [`CredentialStore::update_after_refresh`].
#[derive(Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Only set when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("rotated_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Encrypted credential storage, one record per (provider, account).
///
/// # Security
/// - Access and refresh tokens are encrypted separately with unique nonces
/// - Master key is held in memory only for the lifetime of the store
/// - A record that fails to decrypt is an error, never "no credential"
pub struct CredentialStore {
    records: Box<dyn RecordStore>,
    encryptor: Encryptor,
}

impl CredentialStore {
    pub fn new(records: impl RecordStore + 'static, encryptor: Encryptor) -> Self {
        Self {
            records: Box::new(records),
            encryptor,
        }
    }

    /// Opens (or creates) a SQLite-backed store, resolving the key from `key_source`.
    pub fn open<P: AsRef<Path>>(db_path: P, key_source: &KeySource) -> Result<Self> {
        let key = key_source.resolve()?;
        let encryptor = Encryptor::new(&key)?;
        let records = SqliteRecordStore::open(db_path)?;
        debug!("Credential store opened");
        Ok(Self::new(records, encryptor))
    }

    /// In-memory store with the given raw key; used by tests and embedders.
    pub fn in_memory(key: &[u8]) -> Result<Self> {
        Ok(Self::new(MemoryRecordStore::new(), Encryptor::new(key)?))
    }

    /// Persists the result of a completed authorization (upsert).
    pub fn save(&self, result: &FlowResult) -> Result<()> {
        let access_token = self.encryptor.encrypt(&result.access_token)?;
        let refresh_token = match &result.refresh_token {
            Some(token) => Some(self.encryptor.encrypt(token)?),
            None => None,
        };

        let now = Utc::now();
        self.records.upsert(&StoredRecord {
            provider: result.provider.clone(),
            account_id: result.account_id.clone(),
            access_token,
            refresh_token,
            token_type: result.token_type.clone(),
            expires_at: result.expires_at,
            scope: result.scope.clone(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
            last_refreshed_at: None,
        })?;

        debug!(
            provider = %result.provider,
            account = %result.account_id,
            has_refresh_token = result.refresh_token.is_some(),
            "Stored encrypted credential"
        );
        Ok(())
    }

    /// Loads and decrypts one credential.
    ///
    /// # Returns
    /// * `Ok(None)` - No record for this key
    /// * `Err(Error::DecryptionFailed)` - Record exists but cannot be decrypted
    pub fn get(&self, provider: &str, account_id: &str) -> Result<Option<Credential>> {
        match self.records.get(provider, account_id)? {
            Some(record) => Ok(Some(self.decrypt_record(record)?)),
            None => Ok(None),
        }
    }

    /// Like [`CredentialStore::get`] but a missing record is an error.
    pub fn require(&self, provider: &str, account_id: &str) -> Result<Credential> {
        self.get(provider, account_id)?
            .ok_or_else(|| Error::CredentialNotFound {
                provider: provider.to_string(),
                account: account_id.to_string(),
            })
    }

    /// Lists stored accounts for a provider without decrypting anything.
    pub fn list_accounts(&self, provider: &str) -> Result<Vec<AccountSummary>> {
        Ok(self
            .records
            .list_by_provider(provider)?
            .iter()
            .map(AccountSummary::from)
            .collect())
    }

    /// Rotates the access token and expiry after a refresh, and the refresh
    /// token only when a new one was issued.
    pub fn update_after_refresh(
        &self,
        provider: &str,
        account_id: &str,
        refreshed: &RefreshedToken,
    ) -> Result<()> {
        let rotation = TokenRotation {
            access_token: self.encryptor.encrypt(&refreshed.access_token)?,
            refresh_token: match &refreshed.refresh_token {
                Some(token) => Some(self.encryptor.encrypt(token)?),
                None => None,
            },
            expires_at: refreshed.expires_at,
            scope: refreshed.scope.clone(),
            refreshed_at: Utc::now(),
        };

        if !self.records.rotate(provider, account_id, &rotation)? {
            return Err(Error::CredentialNotFound {
                provider: provider.to_string(),
                account: account_id.to_string(),
            });
        }

        debug!(
            provider = %provider,
            account = %account_id,
            rotated_refresh_token = refreshed.refresh_token.is_some(),
            "Stored refreshed credential"
        );
        Ok(())
    }

    /// Records that the credential was handed out for use.
    pub fn touch(&self, provider: &str, account_id: &str) -> Result<bool> {
        self.records.touch_last_used(provider, account_id, Utc::now())
    }

    /// Deletes a credential. Returns false if none existed.
    pub fn delete(&self, provider: &str, account_id: &str) -> Result<bool> {
        self.records.delete(provider, account_id)
    }

    fn decrypt_record(&self, record: StoredRecord) -> Result<Credential> {
        let access_token = self.encryptor.decrypt(&record.access_token)?;
        let refresh_token = match &record.refresh_token {
            Some(token) => Some(self.encryptor.decrypt(token)?),
            None => None,
        };

        Ok(Credential {
            provider: record.provider,
            account_id: record.account_id,
            access_token,
            refresh_token,
            token_type: record.token_type,
            expires_at: record.expires_at,
            scope: record.scope,
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_used_at: record.last_used_at,
            last_refreshed_at: record.last_refreshed_at,
        })
    }
}
