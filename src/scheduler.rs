//! Background refresh of stored credentials.
//!
//! Every tick sweeps all stored credentials of every registered provider and
//! refreshes those within the margin of expiry that have a refresh token.
//! Failures are logged and audited, then left for the next tick: there is no
//! backoff and no retry cap.
//!
//! Sweeps and manual [`RefreshScheduler::refresh_now`] calls share one lock,
//! so they never overlap.

use crate::audit::{AuditSink, CATEGORY_REFRESH};
use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::oauth::{Provider, ProviderRegistry};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_MARGIN: Duration = Duration::from_secs(15 * 60);

/// Outcome counts of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Credentials examined
    pub checked: usize,
    pub refreshed: usize,
    /// Refresh attempts that failed (including undecryptable records)
    pub failed: usize,
    /// Expiring credentials without a refresh token
    pub skipped: usize,
}

struct Sweeper {
    registry: Arc<ProviderRegistry>,
    store: Arc<CredentialStore>,
    audit: Arc<dyn AuditSink>,
    margin: chrono::Duration,
    sweep_lock: tokio::sync::Mutex<()>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RefreshScheduler {
    sweeper: Arc<Sweeper>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl RefreshScheduler {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<CredentialStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sweeper: Arc::new(Sweeper {
                registry,
                store,
                audit,
                margin: chrono::Duration::seconds(DEFAULT_SWEEP_MARGIN.as_secs() as i64),
                sweep_lock: tokio::sync::Mutex::new(()),
            }),
            interval: DEFAULT_SWEEP_INTERVAL,
            running: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        if let (Some(sweeper), Ok(margin)) = (
            Arc::get_mut(&mut self.sweeper),
            chrono::Duration::from_std(margin),
        ) {
            sweeper.margin = margin;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawns the sweep loop. The first sweep runs immediately, then one per
    /// interval; ticks missed during a long sweep are skipped. The loop ends
    /// when `signal` fires or [`RefreshScheduler::stop`] is called, after
    /// finishing any sweep in progress. Returns false if already running.
    pub fn start(&self, signal: CancellationToken) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("Refresh scheduler already running");
            return false;
        }

        let cancel = signal.child_token();
        let token = cancel.clone();
        let sweeper = Arc::clone(&self.sweeper);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Refresh scheduler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweeper.sweep().await;
                    }
                }
            }
            info!("Refresh scheduler stopped");
        });

        *running = Some(Running { cancel, handle });
        true
    }

    /// Stops the loop and waits for it, including any sweep in progress.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "Refresh scheduler task failed");
            }
        }
    }

    /// Runs one sweep now, waiting for any sweep already in progress.
    pub async fn sweep(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Refreshes one credential immediately, regardless of its expiry.
    /// Serialised with sweeps.
    pub async fn refresh_now(&self, provider: &str, account_id: &str) -> Result<()> {
        let _guard = self.sweeper.sweep_lock.lock().await;
        let provider = self.sweeper.registry.get(provider)?;
        self.sweeper.refresh_one(provider.as_ref(), account_id).await
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.cancel.cancel();
        }
    }
}

impl Sweeper {
    async fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let now = Utc::now();
        let mut report = SweepReport::default();

        for name in self.registry.names() {
            let Ok(provider) = self.registry.get(&name) else {
                continue;
            };
            let accounts = match self.store.list_accounts(&name) {
                Ok(accounts) => accounts,
                Err(e) => {
                    error!(provider = %name, error = %e, "Failed to list stored credentials");
                    continue;
                }
            };

            for account in accounts {
                report.checked += 1;
                if !account.expires_within(self.margin, now) {
                    continue;
                }
                if !account.has_refresh_token {
                    warn!(
                        provider = %name,
                        account = %account.account_id,
                        expires_at = ?account.expires_at,
                        "Credential expiring without a refresh token, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }

                match self.refresh_one(provider.as_ref(), &account.account_id).await {
                    Ok(()) => report.refreshed += 1,
                    Err(_) => report.failed += 1,
                }
            }
        }

        debug!(
            checked = report.checked,
            refreshed = report.refreshed,
            failed = report.failed,
            skipped = report.skipped,
            "Refresh sweep complete"
        );
        report
    }

    /// Caller must hold `sweep_lock`.
    async fn refresh_one(&self, provider: &dyn Provider, account_id: &str) -> Result<()> {
        let name = provider.name();
        let outcome = self.try_refresh(provider, account_id).await;

        match &outcome {
            Ok(()) => {
                info!(provider = %name, account = %account_id, "Credential refreshed");
                self.audit.record(
                    CATEGORY_REFRESH,
                    &format!("refreshed {name}/{account_id}"),
                    None,
                );
            }
            Err(e) => {
                error!(provider = %name, account = %account_id, error = %e, "Credential refresh failed");
                self.audit.record(
                    CATEGORY_REFRESH,
                    &format!("refresh failed for {name}/{account_id}"),
                    Some(e),
                );
            }
        }
        outcome
    }

    async fn try_refresh(&self, provider: &dyn Provider, account_id: &str) -> Result<()> {
        let credential = self.store.require(provider.name(), account_id)?;
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or(Error::RefreshUnsupported)?;

        let refreshed = provider.refresh(refresh_token).await?.into_refreshed(Utc::now())?;
        self.store
            .update_after_refresh(provider.name(), account_id, &refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::credentials::{Encryptor, FlowResult, MemoryRecordStore, RecordStore, StoredRecord};
    use crate::testing::{FakeProvider, TEST_KEY};

    struct Fixture {
        providers: Vec<Arc<FakeProvider>>,
        records: Arc<MemoryRecordStore>,
        store: Arc<CredentialStore>,
        audit: Arc<MemoryAuditSink>,
        scheduler: RefreshScheduler,
    }

    fn fixture(fakes: Vec<FakeProvider>) -> Fixture {
        let registry = Arc::new(ProviderRegistry::new());
        let providers: Vec<Arc<FakeProvider>> = fakes.into_iter().map(Arc::new).collect();
        for provider in &providers {
            registry.register(provider.clone());
        }
        let records = Arc::new(MemoryRecordStore::new());
        let store = Arc::new(CredentialStore::new(
            records.clone(),
            Encryptor::new(&TEST_KEY).unwrap(),
        ));
        let audit = Arc::new(MemoryAuditSink::new());
        let scheduler = RefreshScheduler::new(registry, store.clone(), audit.clone());
        Fixture {
            providers,
            records,
            store,
            audit,
            scheduler,
        }
    }

    fn seed(
        store: &CredentialStore,
        provider: &str,
        account: &str,
        expires_in: Option<chrono::Duration>,
        refresh_token: Option<&str>,
    ) {
        store
            .save(&FlowResult {
                provider: provider.to_string(),
                account_id: account.to_string(),
                access_token: format!("access-{account}"),
                refresh_token: refresh_token.map(str::to_string),
                token_type: "bearer".to_string(),
                expires_at: expires_in.map(|d| Utc::now() + d),
                scope: String::new(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_refreshes_only_eligible() {
        let f = fixture(vec![FakeProvider::new("a"), FakeProvider::new("b")]);
        let minutes = chrono::Duration::minutes;

        seed(&f.store, "a", "soon", Some(minutes(5)), Some("rt-soon"));
        seed(&f.store, "a", "expired", Some(minutes(-10)), Some("rt-expired"));
        seed(&f.store, "a", "later", Some(minutes(60)), Some("rt-later"));
        seed(&f.store, "a", "forever", None, Some("rt-forever"));
        seed(&f.store, "b", "no-refresh", Some(minutes(1)), None);
        seed(&f.store, "b", "soon", Some(minutes(14)), Some("rt-b"));

        let report = f.scheduler.sweep().await;

        assert_eq!(
            report,
            SweepReport {
                checked: 6,
                refreshed: 3,
                failed: 0,
                skipped: 1,
            }
        );
        assert_eq!(f.providers[0].refresh_count(), 2);
        assert_eq!(f.providers[1].refresh_count(), 1);
        assert_eq!(f.audit.by_category(CATEGORY_REFRESH).len(), 3);

        let soon = f.store.require("a", "soon").unwrap();
        assert!(soon.access_token.starts_with("refreshed-"));
        assert_eq!(soon.refresh_token.as_deref(), Some("rt-soon"));
        assert_eq!(f.store.require("a", "later").unwrap().access_token, "access-later");
    }

    #[tokio::test]
    async fn test_failed_refresh_is_audited_not_retried() {
        let f = fixture(vec![FakeProvider::new("a")]);
        f.providers[0].revoke("rt-revoked");
        seed(&f.store, "a", "revoked", Some(chrono::Duration::minutes(1)), Some("rt-revoked"));
        seed(&f.store, "a", "ok", Some(chrono::Duration::minutes(1)), Some("rt-ok"));

        let report = f.scheduler.sweep().await;
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.providers[0].refresh_count(), 2);

        let entries = f.audit.by_category(CATEGORY_REFRESH);
        let failure = entries.iter().find(|e| e.error.is_some()).unwrap();
        assert!(failure.description.contains("a/revoked"));
        assert!(failure.error.as_deref().unwrap().contains("invalid_grant"));

        // Next sweep tries again
        f.scheduler.sweep().await;
        assert_eq!(f.providers[0].refresh_count(), 3);
    }

    #[tokio::test]
    async fn test_undecryptable_record_is_skipped() {
        let f = fixture(vec![FakeProvider::new("a")]);
        let now = Utc::now();
        f.records
            .upsert(&StoredRecord {
                provider: "a".to_string(),
                account_id: "tampered".to_string(),
                access_token: "not-ciphertext".to_string(),
                refresh_token: Some("not-ciphertext-either".to_string()),
                token_type: "bearer".to_string(),
                expires_at: Some(now),
                scope: String::new(),
                created_at: now,
                updated_at: now,
                last_used_at: None,
                last_refreshed_at: None,
            })
            .unwrap();
        seed(&f.store, "a", "good", Some(chrono::Duration::minutes(1)), Some("rt"));

        let report = f.scheduler.sweep().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(f.providers[0].refresh_count(), 1);

        let failure = f
            .audit
            .entries()
            .into_iter()
            .find(|e| e.description.contains("tampered"))
            .unwrap();
        assert!(failure.error.unwrap().contains("decryption failed"));
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_serialize() {
        let mut fake = FakeProvider::new("a");
        fake.refresh_delay = Duration::from_millis(50);
        let f = fixture(vec![fake]);
        seed(&f.store, "a", "soon", Some(chrono::Duration::minutes(1)), Some("rt"));

        let (first, second) = tokio::join!(f.scheduler.sweep(), f.scheduler.sweep());

        // The second sweep saw the already refreshed credential
        assert_eq!(first.refreshed + second.refreshed, 1);
        assert_eq!(f.providers[0].refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_now() {
        let f = fixture(vec![FakeProvider::new("a")]);
        seed(&f.store, "a", "fresh", Some(chrono::Duration::hours(2)), Some("rt"));

        f.scheduler.refresh_now("a", "fresh").await.unwrap();
        assert_eq!(f.providers[0].refresh_count(), 1);
        assert_eq!(
            f.store.require("a", "fresh").unwrap().access_token,
            "refreshed-1"
        );

        assert!(matches!(
            f.scheduler.refresh_now("missing", "fresh").await,
            Err(Error::ProviderNotFound(_))
        ));
        assert!(matches!(
            f.scheduler.refresh_now("a", "nobody").await,
            Err(Error::CredentialNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_runs_first_sweep_and_stop_waits() {
        let f = fixture(vec![FakeProvider::new("a")]);
        seed(&f.store, "a", "soon", Some(chrono::Duration::minutes(1)), Some("rt"));
        let scheduler = f.scheduler.with_interval(Duration::from_secs(3600));

        assert!(scheduler.start(CancellationToken::new()));
        assert!(!scheduler.start(CancellationToken::new()));

        for _ in 0..100 {
            if f.providers[0].refresh_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.providers[0].refresh_count(), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_waits_for_sweep_in_progress() {
        let mut fake = FakeProvider::new("a");
        fake.refresh_delay = Duration::from_millis(300);
        let f = fixture(vec![fake]);
        seed(&f.store, "a", "soon", Some(chrono::Duration::minutes(1)), Some("rt"));
        let scheduler = f.scheduler.with_interval(Duration::from_secs(3600));

        scheduler.start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.providers[0].refresh_count(), 1);
        assert_eq!(f.store.require("a", "soon").unwrap().access_token, "access-soon");

        scheduler.stop().await;

        // The in-flight refresh was persisted before stop returned
        assert_eq!(f.store.require("a", "soon").unwrap().access_token, "refreshed-1");
        assert_eq!(f.audit.by_category(CATEGORY_REFRESH).len(), 1);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_refresh_now_waits_for_running_sweep() {
        let mut fake = FakeProvider::new("a");
        fake.refresh_delay = Duration::from_millis(100);
        let f = fixture(vec![fake]);
        seed(&f.store, "a", "soon", Some(chrono::Duration::minutes(1)), Some("rt-soon"));
        seed(&f.store, "a", "later", Some(chrono::Duration::hours(2)), Some("rt-later"));

        let (report, manual) = tokio::join!(
            f.scheduler.sweep(),
            f.scheduler.refresh_now("a", "later")
        );

        assert_eq!(report.refreshed, 1);
        manual.unwrap();
        assert_eq!(f.providers[0].refresh_count(), 2);
        assert_eq!(f.providers[0].max_concurrent_refreshes(), 1);

        let (manual, report) = tokio::join!(
            f.scheduler.refresh_now("a", "soon"),
            f.scheduler.sweep()
        );
        manual.unwrap();
        assert_eq!(report.refreshed, 0);
        assert_eq!(f.providers[0].max_concurrent_refreshes(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_lifetime_keeps_loop_alive() {
        let mut fake = FakeProvider::new("a");
        fake.expires_in = Some(i64::MAX / 10);
        let f = fixture(vec![fake]);
        seed(&f.store, "a", "soon", Some(chrono::Duration::minutes(1)), Some("rt"));
        let scheduler = f.scheduler.with_interval(Duration::from_secs(3600));

        scheduler.start(CancellationToken::new());
        for _ in 0..100 {
            if !f.audit.by_category(CATEGORY_REFRESH).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let entries = f.audit.by_category(CATEGORY_REFRESH);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error.is_some());
        assert!(scheduler.is_running());
        assert_eq!(f.store.require("a", "soon").unwrap().access_token, "access-soon");

        assert_eq!(scheduler.sweep().await.failed, 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_signal_stops_loop() {
        let f = fixture(vec![FakeProvider::new("a")]);
        let scheduler = f.scheduler.with_interval(Duration::from_millis(10));
        let signal = CancellationToken::new();

        scheduler.start(signal.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        signal.cancel();

        for _ in 0..100 {
            if !scheduler.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_custom_margin() {
        let f = fixture(vec![FakeProvider::new("a")]);
        seed(&f.store, "a", "in-45", Some(chrono::Duration::minutes(45)), Some("rt"));
        let scheduler = f.scheduler.with_margin(Duration::from_secs(3600));

        assert_eq!(scheduler.sweep().await.refreshed, 1);
    }
}
