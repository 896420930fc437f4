//! Audit sink for credential lifecycle events.
//!
//! Every authorization, refresh and disconnect is reported as a
//! fire-and-forget `(category, description, error)` record. Recording never
//! fails and never blocks on I/O.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

pub const CATEGORY_AUTHORIZE: &str = "oauth.authorize";
pub const CATEGORY_REFRESH: &str = "oauth.refresh";
pub const CATEGORY_DISCONNECT: &str = "oauth.disconnect";

pub trait AuditSink: Send + Sync {
    fn record(&self, category: &str, description: &str, error: Option<&(dyn std::error::Error + 'static)>);
}

/// Emits audit records as `tracing` events on the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, category: &str, description: &str, error: Option<&(dyn std::error::Error + 'static)>) {
        match error {
            Some(e) => tracing::warn!(target: "audit", category, error = %e, "{description}"),
            None => tracing::info!(target: "audit", category, "{description}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub category: String,
    pub description: String,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn by_category(&self, category: &str) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.category == category)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, category: &str, description: &str, error: Option<&(dyn std::error::Error + 'static)>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AuditEntry {
                category: category.to_string(),
                description: description.to_string(),
                error: error.map(|e| e.to_string()),
                at: Utc::now(),
            });
    }
}
