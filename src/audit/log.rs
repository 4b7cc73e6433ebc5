//! Append-only, hash-chained audit log backed by a single SQLite file.
//!
//! Storage choice: spec names the on-disk file `runs/<run_id>/audit.db` and
//! calls it a "single-file DB"; `sqlx`'s `sqlite` feature (already part of
//! the dependency stack) gives us exactly that without inventing a bespoke
//! file format, while the hash chain itself — absent from the database —
//! is what actually provides tamper evidence.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::audit::entry::{compute_hash, AuditEntry, GENESIS_PREV_HASH};
use crate::error::{MoatError, Result};

/// Result of replaying the hash chain end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Whether every entry's hash matches its recomputation and every
    /// `prev_hash` matches its predecessor's `hash`.
    pub valid: bool,
    /// Total entries examined.
    pub count: u64,
    /// Sequence number of the first break, if `valid` is `false`.
    pub first_invalid_seq: Option<u64>,
}

/// One run's audit log.
pub struct AuditLog {
    pool: SqlitePool,
    // Serializes appends: one writer per run, matching the
    // concurrency model's "audit append is linearisable per run".
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open (creating if necessary) the audit log at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| MoatError::Io(std::io::Error::other(e.to_string())))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY,
                ts TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                hash TEXT NOT NULL,
                signature TEXT,
                public_key TEXT
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| MoatError::Io(std::io::Error::other(e.to_string())))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Append a new entry with `kind` and `payload`, returning the
    /// persisted entry (with its computed `seq`, `prev_hash`, and `hash`).
    pub async fn append(&self, kind: &str, payload: serde_json::Value) -> Result<AuditEntry> {
        let _guard = self.write_lock.lock().await;

        let last = self.last_entry().await?;
        let (seq, prev_hash) = match &last {
            Some(e) => (e.seq + 1, e.hash.clone()),
            None => (0, GENESIS_PREV_HASH.to_string()),
        };
        let ts = chrono::Utc::now();
        let hash = compute_hash(&prev_hash, seq, ts, kind, &payload);

        sqlx::query(
            "INSERT INTO entries (seq, ts, kind, payload, prev_hash, hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(i64::try_from(seq).unwrap_or(i64::MAX))
        .bind(ts.to_rfc3339())
        .bind(kind)
        .bind(payload.to_string())
        .bind(&prev_hash)
        .bind(&hash)
        .execute(&self.pool)
        .await
        .map_err(|e| MoatError::Io(std::io::Error::other(e.to_string())))?;

        Ok(AuditEntry {
            seq,
            ts,
            kind: kind.to_string(),
            payload,
            prev_hash,
            hash,
        })
    }

    async fn last_entry(&self) -> Result<Option<AuditEntry>> {
        let row = sqlx::query("SELECT seq, ts, kind, payload, prev_hash, hash FROM entries ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MoatError::Io(std::io::Error::other(e.to_string())))?;
        row.map(row_to_entry).transpose()
    }

    /// Read every entry in sequence order.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query("SELECT seq, ts, kind, payload, prev_hash, hash FROM entries ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MoatError::Io(std::io::Error::other(e.to_string())))?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// Replay the hash chain and report its validity (testable invariant 1).
    pub async fn verify(&self) -> Result<VerifyReport> {
        let entries = self.entries().await?;
        let mut prev_hash = GENESIS_PREV_HASH.to_string();
        for entry in &entries {
            if entry.prev_hash != prev_hash || !entry.hash_is_self_consistent() {
                return Ok(VerifyReport {
                    valid: false,
                    count: entries.len() as u64,
                    first_invalid_seq: Some(entry.seq),
                });
            }
            prev_hash = entry.hash.clone();
        }
        Ok(VerifyReport {
            valid: true,
            count: entries.len() as u64,
            first_invalid_seq: None,
        })
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let seq: i64 = row.try_get("seq").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;
    let ts_str: String = row.try_get("ts").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;
    let ts = chrono::DateTime::parse_from_rfc3339(&ts_str)
        .map_err(|e| MoatError::Corrupt {
            location: "audit.db".to_string(),
            reason: e.to_string(),
        })?
        .with_timezone(&chrono::Utc);
    let kind: String = row.try_get("kind").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;
    let payload_str: String = row.try_get("payload").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;
    let payload: serde_json::Value = serde_json::from_str(&payload_str)?;
    let prev_hash: String = row.try_get("prev_hash").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;
    let hash: String = row.try_get("hash").map_err(|e| MoatError::Corrupt {
        location: "audit.db".to_string(),
        reason: e.to_string(),
    })?;

    Ok(AuditEntry {
        seq: u64::try_from(seq).unwrap_or(0),
        ts,
        kind,
        payload,
        prev_hash,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn append_then_verify_is_valid() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.db")).await.unwrap();
        log.append("grant", serde_json::json!({"provider": "github"})).await.unwrap();
        log.append("request", serde_json::json!({"host": "api.github.com"})).await.unwrap();

        let report = log.verify().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.count, 2);
    }

    #[tokio::test]
    async fn chain_links_prev_hash_to_predecessor_hash() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.db")).await.unwrap();
        let first = log.append("a", serde_json::json!({})).await.unwrap();
        let second = log.append("b", serde_json::json!({})).await.unwrap();
        assert_eq!(first.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(second.prev_hash, first.hash);
    }

    #[tokio::test]
    async fn tampering_one_payload_byte_is_detected_at_that_seq() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let log = AuditLog::open(&path).await.unwrap();
        log.append("a", serde_json::json!({"x": 1})).await.unwrap();
        log.append("b", serde_json::json!({"x": 2})).await.unwrap();
        log.append("c", serde_json::json!({"x": 3})).await.unwrap();

        sqlx::query("UPDATE entries SET payload = ? WHERE seq = 1")
            .bind(serde_json::json!({"x": 999}).to_string())
            .execute(&log.pool)
            .await
            .unwrap();

        let report = log.verify().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_invalid_seq, Some(1));
    }
}
