//! Upstream key repository: the persistent pool of provider credentials plus
//! the append-only request log.
//!
//! The [`KeyRepository`] trait is the storage contract; [`SqliteRepository`]
//! is the embedded implementation. A networked relational backend would
//! implement the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};
use uuid::Uuid;

/// Lifecycle state of an upstream key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Inactive,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Inactive => "inactive",
            KeyStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(KeyStatus::Active),
            "inactive" => Some(KeyStatus::Inactive),
            "revoked" => Some(KeyStatus::Revoked),
            _ => None,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One credential in the pool.
///
/// Deliberately not `Serialize` — the raw secret must never reach a response
/// body. Display types in [`crate::response`] carry the masked form.
#[derive(Debug, Clone)]
pub struct UpstreamKey {
    pub id: String,
    pub secret: String,
    pub status: KeyStatus,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub total_requests_all_time: u64,
    pub usage_last_1m: u64,
    pub usage_last_1h: u64,
    pub usage_last_24h: u64,
    pub active_keys: u64,
    pub inactive_keys: u64,
    pub revoked_keys: u64,
    pub total_keys: u64,
}

/// Storage contract for the key pool.
///
/// Logical operations are individually atomic; the core requires no
/// multi-statement transactions.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Insert a new key as Active. Fails with [`crate::Error::DuplicateSecret`]
    /// when the secret is already present.
    async fn add(&self, secret: &str, name: Option<&str>) -> Result<String, crate::Error>;

    async fn get_by_id(&self, id: &str) -> Result<Option<UpstreamKey>, crate::Error>;

    async fn get_by_secret(&self, secret: &str) -> Result<Option<UpstreamKey>, crate::Error>;

    /// All keys, newest first.
    async fn list_all(&self) -> Result<Vec<UpstreamKey>, crate::Error>;

    /// One page of keys ordered by `last_used_at` descending (nulls last),
    /// plus the total row count for the filter.
    async fn list_paginated(
        &self,
        page: u32,
        page_size: u32,
        status: Option<KeyStatus>,
    ) -> Result<(Vec<UpstreamKey>, u64), crate::Error>;

    /// Active keys, coldest first (`last_used_at` ascending, nulls first).
    /// This ordering is the basis of fair rotation at ring rebuild.
    async fn list_active(&self, limit: u32) -> Result<Vec<UpstreamKey>, crate::Error>;

    async fn set_status(&self, id: &str, status: KeyStatus) -> Result<bool, crate::Error>;

    async fn set_name(&self, id: &str, name: &str) -> Result<bool, crate::Error>;

    async fn touch_last_used(&self, id: &str) -> Result<bool, crate::Error>;

    async fn increment_total_requests(&self, id: &str) -> Result<bool, crate::Error>;

    async fn delete(&self, id: &str) -> Result<bool, crate::Error>;

    /// Append one request-log row. Every successful dispatch records exactly
    /// one entry.
    async fn append_log(
        &self,
        key_id: &str,
        model: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<(), crate::Error>;

    async fn stats_snapshot(&self) -> Result<StatsSnapshot, crate::Error>;

    /// Delete log rows older than the cutoff. Returns the pruned count.
    async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64, crate::Error>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS upstream_keys (
    id TEXT PRIMARY KEY,
    secret TEXT UNIQUE NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'inactive', 'revoked')),
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    name TEXT,
    total_requests INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_upstream_keys_status ON upstream_keys(status);

CREATE TABLE IF NOT EXISTS request_logs (
    id TEXT PRIMARY KEY,
    key_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    model TEXT,
    outcome TEXT
);

CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_request_logs_key ON request_logs(key_id, timestamp);
";

/// Embedded SQLite repository.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, crate::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::Error::Storage(format!("failed to create database directory: {e}"))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| crate::Error::Storage(format!("failed to open database: {e}")))?;
        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        info!(path = %path.display(), "Key repository opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self, crate::Error> {
        let conn = Connection::open_in_memory()
            .map_err(|e| crate::Error::Storage(format!("failed to open database: {e}")))?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn storage_err(e: rusqlite::Error) -> crate::Error {
    error!(error = %e, "Repository operation failed");
    crate::Error::Storage(e.to_string())
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpstreamKey> {
    let status_raw: String = row.get("status")?;
    let status = KeyStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown key status: {status_raw}").into(),
        )
    })?;
    let created_raw: String = row.get("created_at")?;
    let last_used_raw: Option<String> = row.get("last_used_at")?;
    let last_used_at = match last_used_raw {
        Some(raw) => Some(parse_timestamp(4, raw)?),
        None => None,
    };
    Ok(UpstreamKey {
        id: row.get("id")?,
        secret: row.get("secret")?,
        status,
        name: row.get("name")?,
        created_at: parse_timestamp(3, created_raw)?,
        last_used_at,
        total_requests: row.get::<_, i64>("total_requests")? as u64,
    })
}

#[async_trait]
impl KeyRepository for SqliteRepository {
    async fn add(&self, secret: &str, name: Option<&str>) -> Result<String, crate::Error> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let result = self.conn().execute(
            "INSERT INTO upstream_keys (id, secret, status, created_at, name, total_requests)
             VALUES (?1, ?2, 'active', ?3, ?4, 0)",
            rusqlite::params![id, secret, created_at, name],
        );
        match result {
            Ok(_) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(crate::Error::DuplicateSecret)
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<UpstreamKey>, crate::Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT * FROM upstream_keys WHERE id = ?1")
            .map_err(storage_err)?;
        let mut rows = stmt
            .query_map([id], row_to_key)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        Ok(rows.pop())
    }

    async fn get_by_secret(&self, secret: &str) -> Result<Option<UpstreamKey>, crate::Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT * FROM upstream_keys WHERE secret = ?1")
            .map_err(storage_err)?;
        let mut rows = stmt
            .query_map([secret], row_to_key)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        Ok(rows.pop())
    }

    async fn list_all(&self) -> Result<Vec<UpstreamKey>, crate::Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT * FROM upstream_keys ORDER BY created_at DESC")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], row_to_key)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        Ok(rows)
    }

    async fn list_paginated(
        &self,
        page: u32,
        page_size: u32,
        status: Option<KeyStatus>,
    ) -> Result<(Vec<UpstreamKey>, u64), crate::Error> {
        let page = page.max(1);
        let offset = (page - 1) as i64 * page_size as i64;
        let conn = self.conn();

        let (total, items) = match status {
            Some(status) => {
                let total: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM upstream_keys WHERE status = ?1",
                        [status.as_str()],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?;
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM upstream_keys WHERE status = ?1
                         ORDER BY last_used_at DESC NULLS LAST LIMIT ?2 OFFSET ?3",
                    )
                    .map_err(storage_err)?;
                let items = stmt
                    .query_map(
                        rusqlite::params![status.as_str(), page_size as i64, offset],
                        row_to_key,
                    )
                    .map_err(storage_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage_err)?;
                (total, items)
            }
            None => {
                let total: i64 = conn
                    .query_row("SELECT COUNT(*) FROM upstream_keys", [], |row| row.get(0))
                    .map_err(storage_err)?;
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM upstream_keys
                         ORDER BY last_used_at DESC NULLS LAST LIMIT ?1 OFFSET ?2",
                    )
                    .map_err(storage_err)?;
                let items = stmt
                    .query_map(rusqlite::params![page_size as i64, offset], row_to_key)
                    .map_err(storage_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(storage_err)?;
                (total, items)
            }
        };
        Ok((items, total as u64))
    }

    async fn list_active(&self, limit: u32) -> Result<Vec<UpstreamKey>, crate::Error> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM upstream_keys WHERE status = 'active'
                 ORDER BY last_used_at ASC NULLS FIRST LIMIT ?1",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([limit as i64], row_to_key)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        Ok(rows)
    }

    async fn set_status(&self, id: &str, status: KeyStatus) -> Result<bool, crate::Error> {
        let updated = self
            .conn()
            .execute(
                "UPDATE upstream_keys SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.as_str(), id],
            )
            .map_err(storage_err)?;
        Ok(updated > 0)
    }

    async fn set_name(&self, id: &str, name: &str) -> Result<bool, crate::Error> {
        let updated = self
            .conn()
            .execute(
                "UPDATE upstream_keys SET name = ?1 WHERE id = ?2",
                rusqlite::params![name, id],
            )
            .map_err(storage_err)?;
        Ok(updated > 0)
    }

    async fn touch_last_used(&self, id: &str) -> Result<bool, crate::Error> {
        let updated = self
            .conn()
            .execute(
                "UPDATE upstream_keys SET last_used_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id],
            )
            .map_err(storage_err)?;
        Ok(updated > 0)
    }

    async fn increment_total_requests(&self, id: &str) -> Result<bool, crate::Error> {
        let updated = self
            .conn()
            .execute(
                "UPDATE upstream_keys SET total_requests = total_requests + 1 WHERE id = ?1",
                [id],
            )
            .map_err(storage_err)?;
        Ok(updated > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, crate::Error> {
        let deleted = self
            .conn()
            .execute("DELETE FROM upstream_keys WHERE id = ?1", [id])
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn append_log(
        &self,
        key_id: &str,
        model: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<(), crate::Error> {
        self.conn()
            .execute(
                "INSERT INTO request_logs (id, key_id, timestamp, model, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    key_id,
                    Utc::now().to_rfc3339(),
                    model,
                    outcome
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn stats_snapshot(&self) -> Result<StatsSnapshot, crate::Error> {
        let now = Utc::now();
        let conn = self.conn();
        let mut snapshot = StatsSnapshot::default();

        snapshot.total_requests_all_time = conn
            .query_row(
                "SELECT COALESCE(SUM(total_requests), 0) FROM upstream_keys",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage_err)? as u64;

        let usage_since = |secs: i64| -> Result<u64, crate::Error> {
            let cutoff = (now - chrono::Duration::seconds(secs)).to_rfc3339();
            conn.query_row(
                "SELECT COUNT(*) FROM request_logs WHERE timestamp >= ?1",
                [cutoff],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(storage_err)
        };
        snapshot.usage_last_1m = usage_since(60)?;
        snapshot.usage_last_1h = usage_since(3600)?;
        snapshot.usage_last_24h = usage_since(86_400)?;

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM upstream_keys GROUP BY status")
            .map_err(storage_err)?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;
        for (status, count) in counts {
            match KeyStatus::parse(&status) {
                Some(KeyStatus::Active) => snapshot.active_keys = count,
                Some(KeyStatus::Inactive) => snapshot.inactive_keys = count,
                Some(KeyStatus::Revoked) => snapshot.revoked_keys = count,
                None => {}
            }
            snapshot.total_keys += count;
        }

        Ok(snapshot)
    }

    async fn prune_logs(&self, older_than: DateTime<Utc>) -> Result<u64, crate::Error> {
        let pruned = self
            .conn()
            .execute(
                "DELETE FROM request_logs WHERE timestamp < ?1",
                [older_than.to_rfc3339()],
            )
            .map_err(storage_err)?;
        Ok(pruned as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SqliteRepository {
        SqliteRepository::in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_add_then_get_by_secret_roundtrip() {
        let repo = repo();
        let id = repo.add("sk-roundtrip", Some("first")).await.unwrap();

        let found = repo.get_by_secret("sk-roundtrip").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, KeyStatus::Active);
        assert_eq!(found.name.as_deref(), Some("first"));
        assert_eq!(found.total_requests, 0);
        assert!(found.last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_secret_rejected() {
        let repo = repo();
        repo.add("sk-dup", None).await.unwrap();
        let err = repo.add("sk-dup", Some("again")).await.unwrap_err();
        assert!(matches!(err, crate::Error::DuplicateSecret));
    }

    #[tokio::test]
    async fn test_set_status_is_idempotent() {
        let repo = repo();
        let id = repo.add("sk-status", None).await.unwrap();

        assert!(repo.set_status(&id, KeyStatus::Inactive).await.unwrap());
        assert!(repo.set_status(&id, KeyStatus::Inactive).await.unwrap());
        let key = repo.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Inactive);
    }

    #[tokio::test]
    async fn test_set_status_unknown_id_reports_no_rows() {
        let repo = repo();
        assert!(!repo.set_status("missing", KeyStatus::Revoked).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_then_get_none() {
        let repo = repo();
        let id = repo.add("sk-del", None).await.unwrap();
        assert!(repo.delete(&id).await.unwrap());
        assert!(repo.get_by_id(&id).await.unwrap().is_none());
        assert!(!repo.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_total_requests_is_monotonic() {
        let repo = repo();
        let id = repo.add("sk-mono", None).await.unwrap();
        for expected in 1..=5u64 {
            repo.increment_total_requests(&id).await.unwrap();
            let key = repo.get_by_id(&id).await.unwrap().unwrap();
            assert_eq!(key.total_requests, expected);
        }
    }

    #[tokio::test]
    async fn test_list_active_coldest_first_nulls_lead() {
        let repo = repo();
        let touched = repo.add("sk-touched", None).await.unwrap();
        let cold = repo.add("sk-cold", None).await.unwrap();
        let revoked = repo.add("sk-revoked", None).await.unwrap();
        repo.touch_last_used(&touched).await.unwrap();
        repo.set_status(&revoked, KeyStatus::Revoked).await.unwrap();

        let active = repo.list_active(100).await.unwrap();
        let ids: Vec<&str> = active.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec![cold.as_str(), touched.as_str()]);
    }

    #[tokio::test]
    async fn test_list_active_honors_limit() {
        let repo = repo();
        for i in 0..5 {
            repo.add(&format!("sk-limit-{i}"), None).await.unwrap();
        }
        assert_eq!(repo.list_active(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_paginated_counts_and_filters() {
        let repo = repo();
        let inactive = repo.add("sk-page-0", None).await.unwrap();
        repo.add("sk-page-1", None).await.unwrap();
        repo.add("sk-page-2", None).await.unwrap();
        repo.set_status(&inactive, KeyStatus::Inactive).await.unwrap();

        let (items, total) = repo.list_paginated(1, 2, None).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 2);

        let (items, total) = repo
            .list_paginated(1, 10, Some(KeyStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].id, inactive);
    }

    #[tokio::test]
    async fn test_paginated_orders_recently_used_first() {
        let repo = repo();
        repo.add("sk-idle", None).await.unwrap();
        let busy = repo.add("sk-busy", None).await.unwrap();
        repo.touch_last_used(&busy).await.unwrap();

        let (items, _) = repo.list_paginated(1, 10, None).await.unwrap();
        assert_eq!(items[0].id, busy);
        assert!(items[1].last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_stats_snapshot_counts() {
        let repo = repo();
        let a = repo.add("sk-stats-a", None).await.unwrap();
        let b = repo.add("sk-stats-b", None).await.unwrap();
        repo.set_status(&b, KeyStatus::Inactive).await.unwrap();
        repo.increment_total_requests(&a).await.unwrap();
        repo.increment_total_requests(&a).await.unwrap();
        repo.append_log(&a, Some("m"), Some("success")).await.unwrap();

        let snapshot = repo.stats_snapshot().await.unwrap();
        assert_eq!(snapshot.total_requests_all_time, 2);
        assert_eq!(snapshot.usage_last_1m, 1);
        assert_eq!(snapshot.usage_last_24h, 1);
        assert_eq!(snapshot.active_keys, 1);
        assert_eq!(snapshot.inactive_keys, 1);
        assert_eq!(snapshot.revoked_keys, 0);
        assert_eq!(snapshot.total_keys, 2);
    }

    #[tokio::test]
    async fn test_prune_logs_drops_only_aged_rows() {
        let repo = repo();
        let id = repo.add("sk-prune", None).await.unwrap();
        repo.append_log(&id, None, Some("success")).await.unwrap();

        // Cutoff in the past leaves the fresh row alone.
        let pruned = repo
            .prune_logs(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pruned, 0);

        // Cutoff in the future removes it.
        let pruned = repo
            .prune_logs(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(repo.stats_snapshot().await.unwrap().usage_last_24h, 0);
    }

    #[test]
    fn test_key_status_parse() {
        assert_eq!(KeyStatus::parse("active"), Some(KeyStatus::Active));
        assert_eq!(KeyStatus::parse("inactive"), Some(KeyStatus::Inactive));
        assert_eq!(KeyStatus::parse("revoked"), Some(KeyStatus::Revoked));
        assert_eq!(KeyStatus::parse("ACTIVE"), None);
        assert_eq!(KeyStatus::parse(""), None);
    }
}
