//! Pending authorization attempts, keyed by CSRF state.
//!
//! Each attempt holds the PKCE verifier needed for the code exchange. An
//! attempt is consumed by exactly one callback and expires after a TTL so
//! abandoned flows do not accumulate.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// In-flight authorization attempt
#[derive(Clone)]
pub struct PendingAttempt {
    pub provider: String,
    pub state: String,
    pub verifier: String,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAttempt")
            .field("provider", &self.provider)
            .field("redirect_url", &self.redirect_url)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Attempt table with automatic expiration
#[derive(Clone)]
pub struct PendingAttempts {
    attempts: Arc<Mutex<HashMap<String, PendingAttempt>>>,
    ttl: Duration,
}

impl PendingAttempts {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(600)),
        }
    }

    /// Stores a new attempt, dropping any that already expired.
    pub fn insert(&self, attempt: PendingAttempt) {
        let now = Utc::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.retain(|_, a| now - a.created_at <= self.ttl);
        attempts.insert(attempt.state.clone(), attempt);
    }

    /// Removes and returns the attempt for `state` if it exists and is fresh.
    pub fn validate_and_consume(&self, state: &str) -> Option<PendingAttempt> {
        let entry = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state)?;

        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }
        Some(entry)
    }

    /// Drops an attempt without using it.
    pub fn discard(&self, state: &str) -> bool {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state)
            .is_some()
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let before = attempts.len();
        attempts.retain(|_, a| now - a.created_at <= self.ttl);
        before - attempts.len()
    }

    pub fn count(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Periodically purges expired attempts until `cancel` fires.
pub async fn run_state_cleanup(
    attempts: PendingAttempts,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = attempts.cleanup_expired();
                tracing::debug!(
                    removed,
                    remaining = attempts.count(),
                    "Pending attempt cleanup complete"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(provider: &str, state: &str) -> PendingAttempt {
        PendingAttempt {
            provider: provider.to_string(),
            state: state.to_string(),
            verifier: format!("verifier-{state}"),
            redirect_url: None,
            created_at: Utc::now(),
        }
    }

    fn aged(provider: &str, state: &str, age: Duration) -> PendingAttempt {
        PendingAttempt {
            created_at: Utc::now() - age,
            ..attempt(provider, state)
        }
    }

    #[test]
    fn test_insert_and_consume() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(600));
        attempts.insert(attempt("dropbox", "s1"));

        let entry = attempts.validate_and_consume("s1").unwrap();
        assert_eq!(entry.provider, "dropbox");
        assert_eq!(entry.verifier, "verifier-s1");
    }

    #[test]
    fn test_attempt_is_single_use() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(600));
        attempts.insert(attempt("dropbox", "s1"));

        assert!(attempts.validate_and_consume("s1").is_some());
        assert!(attempts.validate_and_consume("s1").is_none());
    }

    #[test]
    fn test_unknown_state_rejected() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(600));
        assert!(attempts.validate_and_consume("invalid_state").is_none());
    }

    #[test]
    fn test_expired_attempt_rejected() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(60));
        attempts
            .attempts
            .lock()
            .unwrap()
            .insert("old".to_string(), aged("dropbox", "old", Duration::seconds(120)));

        assert!(attempts.validate_and_consume("old").is_none());
        assert_eq!(attempts.count(), 0);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(60));
        {
            let mut map = attempts.attempts.lock().unwrap();
            map.insert("a".into(), aged("dropbox", "a", Duration::seconds(120)));
            map.insert("b".into(), aged("dropbox", "b", Duration::seconds(90)));
        }
        attempts.insert(attempt("dropbox", "fresh"));

        // insert already purged the stale entries
        assert_eq!(attempts.count(), 1);
        assert_eq!(attempts.cleanup_expired(), 0);

        attempts
            .attempts
            .lock()
            .unwrap()
            .insert("c".into(), aged("dropbox", "c", Duration::seconds(61)));
        assert_eq!(attempts.cleanup_expired(), 1);
        assert!(attempts.validate_and_consume("fresh").is_some());
    }

    #[test]
    fn test_discard() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(600));
        attempts.insert(attempt("dropbox", "s1"));

        assert!(attempts.discard("s1"));
        assert!(!attempts.discard("s1"));
        assert_eq!(attempts.count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_cancel() {
        let attempts = PendingAttempts::new(std::time::Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_state_cleanup(
            attempts.clone(),
            std::time::Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("cleanup task did not stop")
            .unwrap();
    }
}
