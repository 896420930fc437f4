//! Fakes shared by unit tests.

use crate::credentials::{MemoryRecordStore, RecordStore, StoredRecord, TokenRotation};
use crate::error::{Error, Result};
use crate::oauth::pkce::{build_url, generate_state};
use crate::oauth::{AccountInfo, AuthorizationRequest, Pkce, Provider, TokenResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Provider double that counts calls and never touches the network.
pub(crate) struct FakeProvider {
    name: String,
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    /// Highest number of `refresh` calls seen running at once
    pub max_concurrent_refreshes: AtomicUsize,
    in_flight_refreshes: AtomicUsize,
    pub account_lookups: AtomicUsize,
    /// (code, verifier) pairs seen by `exchange_code`
    pub exchanged: Mutex<Vec<(String, String)>>,
    /// Account id returned in the token response; `None` forces `account_info`
    pub account_in_token: Option<String>,
    pub account_id: String,
    pub expires_in: Option<i64>,
    pub rotate_refresh_token: bool,
    pub refresh_delay: Duration,
    /// Refresh tokens the fake rejects with `invalid_grant`
    pub revoked: Mutex<HashSet<String>>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            max_concurrent_refreshes: AtomicUsize::new(0),
            in_flight_refreshes: AtomicUsize::new(0),
            account_lookups: AtomicUsize::new(0),
            exchanged: Mutex::new(Vec::new()),
            account_in_token: Some("acct-1".to_string()),
            account_id: "acct-1".to_string(),
            expires_in: Some(3600),
            rotate_refresh_token: false,
            refresh_delay: Duration::ZERO,
            revoked: Mutex::new(HashSet::new()),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_refreshes(&self) -> usize {
        self.max_concurrent_refreshes.load(Ordering::SeqCst)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn revoke(&self, refresh_token: &str) {
        self.revoked.lock().unwrap().insert(refresh_token.to_string());
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_authorization_url(&self, redirect_url: Option<&str>) -> AuthorizationRequest {
        let pkce = Pkce::generate();
        let state = generate_state();
        let mut params = vec![
            ("code_challenge", pkce.challenge.as_str()),
            ("state", state.as_str()),
        ];
        if let Some(redirect) = redirect_url {
            params.push(("redirect_uri", redirect));
        }
        let url = build_url("https://auth.example.com/authorize", &params);
        AuthorizationRequest { url, state, pkce }
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        _redirect_url: Option<&str>,
    ) -> Result<TokenResponse> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.exchanged
            .lock()
            .unwrap()
            .push((code.to_string(), verifier.to_string()));

        if code == "bad-code" {
            return Err(Error::Provider {
                provider: self.name.clone(),
                status: 400,
                code: Some("invalid_grant".to_string()),
                body: r#"{"error":"invalid_grant","error_description":"code doesn't exist or has expired"}"#
                    .to_string(),
            });
        }

        // Code "empty-token" yields a response without a usable token
        let access_token = match code {
            "empty-token" => String::new(),
            _ => format!("access-{code}"),
        };
        Ok(TokenResponse {
            access_token,
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: self.expires_in,
            token_type: Some("bearer".to_string()),
            scope: Some("files.read".to_string()),
            account_id: self.account_in_token.clone(),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.in_flight_refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_refreshes.fetch_max(running, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        self.in_flight_refreshes.fetch_sub(1, Ordering::SeqCst);

        if self.revoked.lock().unwrap().contains(refresh_token) {
            return Err(Error::Provider {
                provider: self.name.clone(),
                status: 400,
                code: Some("invalid_grant".to_string()),
                body: r#"{"error":"invalid_grant"}"#.to_string(),
            });
        }

        Ok(TokenResponse {
            access_token: format!("refreshed-{n}"),
            refresh_token: self
                .rotate_refresh_token
                .then(|| format!("rotated-{n}")),
            expires_in: self.expires_in,
            token_type: Some("bearer".to_string()),
            scope: None,
            account_id: None,
        })
    }

    async fn account_info(&self, _access_token: &str) -> Result<AccountInfo> {
        self.account_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(AccountInfo {
            account_id: self.account_id.clone(),
            email: None,
            display_name: None,
        })
    }
}

/// Record store that counts writes before delegating to memory.
#[derive(Default)]
pub(crate) struct CountingRecordStore {
    inner: MemoryRecordStore,
    pub upserts: AtomicUsize,
    pub rotations: AtomicUsize,
}

impl CountingRecordStore {
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn rotation_count(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

impl RecordStore for CountingRecordStore {
    fn upsert(&self, record: &StoredRecord) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(record)
    }

    fn get(&self, provider: &str, account_id: &str) -> Result<Option<StoredRecord>> {
        self.inner.get(provider, account_id)
    }

    fn list_by_provider(&self, provider: &str) -> Result<Vec<StoredRecord>> {
        self.inner.list_by_provider(provider)
    }

    fn rotate(&self, provider: &str, account_id: &str, rotation: &TokenRotation) -> Result<bool> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        self.inner.rotate(provider, account_id, rotation)
    }

    fn touch_last_used(&self, provider: &str, account_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.inner.touch_last_used(provider, account_id, at)
    }

    fn delete(&self, provider: &str, account_id: &str) -> Result<bool> {
        self.inner.delete(provider, account_id)
    }
}

pub(crate) const TEST_KEY: [u8; 32] = [7u8; 32];
