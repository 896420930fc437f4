//! Persistence seam for encrypted credential records.
//!
//! A `RecordStore` only ever sees ciphertext. Every mutation is a single
//! atomic operation on one (provider, account) key.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One persisted row. Token fields hold encrypted base64 text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
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

/// Field update applied after a successful refresh.
///
/// `refresh_token` and `scope` are only overwritten when present, since
/// providers are not required to rotate either.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRotation {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

/// Generic key/record store keyed by (provider, account).
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces the record for its key. `created_at` and
    /// `last_used_at` of an existing record are preserved.
    fn upsert(&self, record: &StoredRecord) -> Result<()>;

    fn get(&self, provider: &str, account_id: &str) -> Result<Option<StoredRecord>>;

    /// All records for one provider, ordered by account.
    fn list_by_provider(&self, provider: &str) -> Result<Vec<StoredRecord>>;

    /// Applies a refresh. Returns false when no record exists.
    fn rotate(&self, provider: &str, account_id: &str, rotation: &TokenRotation) -> Result<bool>;

    /// Records a use. Returns false when no record exists.
    fn touch_last_used(&self, provider: &str, account_id: &str, at: DateTime<Utc>)
        -> Result<bool>;

    /// Returns false when no record existed.
    fn delete(&self, provider: &str, account_id: &str) -> Result<bool>;
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn upsert(&self, record: &StoredRecord) -> Result<()> {
        (**self).upsert(record)
    }

    fn get(&self, provider: &str, account_id: &str) -> Result<Option<StoredRecord>> {
        (**self).get(provider, account_id)
    }

    fn list_by_provider(&self, provider: &str) -> Result<Vec<StoredRecord>> {
        (**self).list_by_provider(provider)
    }

    fn rotate(&self, provider: &str, account_id: &str, rotation: &TokenRotation) -> Result<bool> {
        (**self).rotate(provider, account_id, rotation)
    }

    fn touch_last_used(
        &self,
        provider: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        (**self).touch_last_used(provider, account_id, at)
    }

    fn delete(&self, provider: &str, account_id: &str) -> Result<bool> {
        (**self).delete(provider, account_id)
    }
}

type Key = (String, String);

/// In-process record store with the same semantics as the SQLite one.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<Key, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<Key, StoredRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

fn key(provider: &str, account_id: &str) -> Key {
    (provider.to_string(), account_id.to_string())
}

impl RecordStore for MemoryRecordStore {
    fn upsert(&self, record: &StoredRecord) -> Result<()> {
        let mut records = self.records();
        let k = key(&record.provider, &record.account_id);
        let mut new = record.clone();
        if let Some(existing) = records.get(&k) {
            new.created_at = existing.created_at;
            new.last_used_at = existing.last_used_at;
        }
        records.insert(k, new);
        Ok(())
    }

    fn get(&self, provider: &str, account_id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.records().get(&key(provider, account_id)).cloned())
    }

    fn list_by_provider(&self, provider: &str) -> Result<Vec<StoredRecord>> {
        Ok(self
            .records()
            .values()
            .filter(|r| r.provider == provider)
            .cloned()
            .collect())
    }

    fn rotate(&self, provider: &str, account_id: &str, rotation: &TokenRotation) -> Result<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(&key(provider, account_id)) else {
            return Ok(false);
        };

        record.access_token = rotation.access_token.clone();
        if let Some(refresh) = &rotation.refresh_token {
            record.refresh_token = Some(refresh.clone());
        }
        if let Some(scope) = &rotation.scope {
            record.scope = scope.clone();
        }
        record.expires_at = rotation.expires_at;
        record.updated_at = rotation.refreshed_at;
        record.last_refreshed_at = Some(rotation.refreshed_at);
        Ok(true)
    }

    fn touch_last_used(
        &self,
        provider: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records();
        match records.get_mut(&key(provider, account_id)) {
            Some(record) => {
                record.last_used_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, provider: &str, account_id: &str) -> Result<bool> {
        Ok(self.records().remove(&key(provider, account_id)).is_some())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn record(provider: &str, account: &str, access: &str) -> StoredRecord {
        let now = Utc::now();
        StoredRecord {
            provider: provider.to_string(),
            account_id: account.to_string(),
            access_token: access.to_string(),
            refresh_token: Some(format!("rt-{access}")),
            token_type: "bearer".to_string(),
            expires_at: Some(now + chrono::Duration::hours(1)),
            scope: "read".to_string(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
            last_refreshed_at: None,
        }
    }

    /// Exercises the contract every `RecordStore` must honour.
    pub fn check_contract(store: &dyn RecordStore) {
        let first = record("dropbox", "a", "at-1");
        store.upsert(&first).unwrap();
        store
            .touch_last_used("dropbox", "a", Utc::now())
            .unwrap();

        // Upsert replaces tokens but keeps creation and usage timestamps
        let mut second = record("dropbox", "a", "at-2");
        second.created_at = first.created_at + chrono::Duration::seconds(30);
        store.upsert(&second).unwrap();

        let stored = store.get("dropbox", "a").unwrap().unwrap();
        assert_eq!(stored.access_token, "at-2");
        assert_eq!(stored.created_at.timestamp(), first.created_at.timestamp());
        assert!(stored.last_used_at.is_some());
        assert_eq!(store.list_by_provider("dropbox").unwrap().len(), 1);

        // Rotation without a new refresh token keeps the old one
        let rotated_at = Utc::now();
        let rotation = TokenRotation {
            access_token: "at-3".to_string(),
            refresh_token: None,
            expires_at: Some(rotated_at + chrono::Duration::hours(4)),
            scope: None,
            refreshed_at: rotated_at,
        };
        assert!(store.rotate("dropbox", "a", &rotation).unwrap());
        let stored = store.get("dropbox", "a").unwrap().unwrap();
        assert_eq!(stored.access_token, "at-3");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt-at-2"));
        assert_eq!(stored.scope, "read");
        assert!(stored.last_refreshed_at.is_some());

        // Rotation with a new refresh token replaces it
        let rotation = TokenRotation {
            refresh_token: Some("rt-new".to_string()),
            scope: Some("read write".to_string()),
            ..rotation
        };
        assert!(store.rotate("dropbox", "a", &rotation).unwrap());
        let stored = store.get("dropbox", "a").unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("rt-new"));
        assert_eq!(stored.scope, "read write");

        // Missing keys
        assert!(!store.rotate("dropbox", "missing", &rotation).unwrap());
        assert!(!store.touch_last_used("dropbox", "missing", Utc::now()).unwrap());
        assert!(store.get("dropbox", "missing").unwrap().is_none());

        // Listing is per provider
        store.upsert(&record("dropbox", "b", "at-b")).unwrap();
        store.upsert(&record("gdrive", "a", "at-g")).unwrap();
        let accounts: Vec<String> = store
            .list_by_provider("dropbox")
            .unwrap()
            .into_iter()
            .map(|r| r.account_id)
            .collect();
        assert_eq!(accounts, vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete("dropbox", "a").unwrap());
        assert!(!store.delete("dropbox", "a").unwrap());
        assert!(store.get("dropbox", "a").unwrap().is_none());
        assert!(store.get("gdrive", "a").unwrap().is_some());
    }
}
