//! SQLite-backed record store.
//!
//! Stores already-encrypted credential records. Each operation is a single
//! statement, so concurrent readers never observe a partially written row.

use super::backend::{RecordStore, StoredRecord, TokenRotation};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Encrypted credential records backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_credentials (
///     id INTEGER PRIMARY KEY,
///     provider TEXT NOT NULL,
///     account_id TEXT NOT NULL,
///     access_token TEXT NOT NULL,       -- Encrypted
///     refresh_token TEXT,               -- Encrypted (optional)
///     token_type TEXT NOT NULL,
///     expires_at TEXT,                  -- RFC 3339 (optional)
///     scope TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     last_used_at TEXT,
///     last_refreshed_at TEXT,
///     UNIQUE(provider, account_id)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex
/// - Two processes sharing one file are not coordinated beyond SQLite's own locking
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

const COLUMNS: &str = "provider, account_id, access_token, refresh_token, token_type, \
     expires_at, scope, created_at, updated_at, last_used_at, last_refreshed_at";

impl SqliteRecordStore {
    /// Creates or opens a record store at `db_path` (`":memory:"` for tests).
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)?;

        if path != Path::new(":memory:") {
            conn.busy_timeout(Duration::from_secs(5))?;
            // journal_mode returns a row, so it cannot go through execute()
            let _mode: String =
                conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_credentials (
                id INTEGER PRIMARY KEY,
                provider TEXT NOT NULL,
                account_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT NOT NULL,
                expires_at TEXT,
                scope TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_used_at TEXT,
                last_refreshed_at TEXT,
                UNIQUE(provider, account_id)
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_credentials_provider
                ON oauth_credentials(provider);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_text(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_time(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_time(index: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(index, v)).transpose()
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        provider: row.get(0)?,
        account_id: row.get(1)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        token_type: row.get(4)?,
        expires_at: parse_optional_time(5, row.get(5)?)?,
        scope: row.get(6)?,
        created_at: parse_time(7, row.get(7)?)?,
        updated_at: parse_time(8, row.get(8)?)?,
        last_used_at: parse_optional_time(9, row.get(9)?)?,
        last_refreshed_at: parse_optional_time(10, row.get(10)?)?,
    })
}

impl RecordStore for SqliteRecordStore {
    fn upsert(&self, record: &StoredRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO oauth_credentials (
                provider, account_id, access_token, refresh_token, token_type,
                expires_at, scope, created_at, updated_at, last_used_at, last_refreshed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(provider, account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at,
                last_refreshed_at = excluded.last_refreshed_at
            "#,
            params![
                record.provider,
                record.account_id,
                record.access_token,
                record.refresh_token,
                record.token_type,
                record.expires_at.as_ref().map(to_text),
                record.scope,
                to_text(&record.created_at),
                to_text(&record.updated_at),
                record.last_used_at.as_ref().map(to_text),
                record.last_refreshed_at.as_ref().map(to_text),
            ],
        )?;
        Ok(())
    }

    fn get(&self, provider: &str, account_id: &str) -> Result<Option<StoredRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM oauth_credentials WHERE provider = ?1 AND account_id = ?2"
        ))?;
        let record = stmt
            .query_row(params![provider, account_id], read_record)
            .optional()?;
        Ok(record)
    }

    fn list_by_provider(&self, provider: &str) -> Result<Vec<StoredRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM oauth_credentials WHERE provider = ?1 ORDER BY account_id"
        ))?;
        let records = stmt
            .query_map(params![provider], read_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn rotate(&self, provider: &str, account_id: &str, rotation: &TokenRotation) -> Result<bool> {
        let refreshed_at = to_text(&rotation.refreshed_at);
        let rows = self.conn().execute(
            r#"
            UPDATE oauth_credentials SET
                access_token = ?3,
                refresh_token = COALESCE(?4, refresh_token),
                expires_at = ?5,
                scope = COALESCE(?6, scope),
                updated_at = ?7,
                last_refreshed_at = ?7
            WHERE provider = ?1 AND account_id = ?2
            "#,
            params![
                provider,
                account_id,
                rotation.access_token,
                rotation.refresh_token,
                rotation.expires_at.as_ref().map(to_text),
                rotation.scope,
                refreshed_at,
            ],
        )?;
        Ok(rows > 0)
    }

    fn touch_last_used(
        &self,
        provider: &str,
        account_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE oauth_credentials SET last_used_at = ?3 WHERE provider = ?1 AND account_id = ?2",
            params![provider, account_id, to_text(&at)],
        )?;
        Ok(rows > 0)
    }

    fn delete(&self, provider: &str, account_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM oauth_credentials WHERE provider = ?1 AND account_id = ?2",
            params![provider, account_id],
        )?;
        Ok(rows > 0)
    }
}
