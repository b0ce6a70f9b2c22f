//! SQLite-backed durable layer, one database file per tenant.
//!
//! The file is the tenant's store of record. Sync batches are written in a
//! single transaction with deferred foreign keys, so a batch either commits
//! completely or leaves the file untouched.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use keeper_core::{IdKind, RecordId, RecordKind, StoreError, Timestamp};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, ToSql};
use thiserror::Error;

use crate::cache::CacheEntry;

/// Schema version written on creation and checked on open.
const SCHEMA_VERSION: i64 = 1;

/// Busy timeout for the tenant connection (ms).
const BUSY_TIMEOUT_MS: u64 = 5_000;

const META_SCHEMA_VERSION: &str = "schema_version";
const META_LAST_SYNC: &str = "last_sync_ms";

/// Durable layer errors.
#[derive(Debug, Error, Clone)]
pub enum DurableError {
    #[error("durable store io error: {0}")]
    Io(String),

    #[error("durable store db error: {0}")]
    Db(String),

    /// A foreign-key, uniqueness or NOT NULL check rejected the batch.
    #[error("durable store constraint violation: {0}")]
    Constraint(String),

    #[error("durable store version mismatch: {0}")]
    VersionMismatch(String),

    #[error("durable write cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for DurableError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => DurableError::Constraint(err.to_string()),
            _ => DurableError::Db(err.to_string()),
        }
    }
}

impl From<DurableError> for StoreError {
    fn from(err: DurableError) -> Self {
        match err {
            DurableError::Cancelled => StoreError::Cancelled,
            other => StoreError::Durable(other.to_string()),
        }
    }
}

/// A record row as read back from the durable layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableRecord {
    pub payload: Vec<u8>,
    pub updated_at: Timestamp,
}

fn table(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Profile => "profiles",
        RecordKind::Company => "companies",
        RecordKind::Job => "jobs",
        RecordKind::MatchResult => "match_results",
    }
}

fn id_column(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::MatchResult => "key",
        _ => "id",
    }
}

fn millis_to_timestamp(millis: i64) -> Timestamp {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// One tenant's SQLite database.
pub struct DurableStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl DurableStore {
    /// Open or create the database at `path` and validate its schema.
    ///
    /// # Errors
    ///
    /// Returns [`DurableError`] when the file cannot be opened, the schema
    /// cannot be created, or an existing schema has a different version.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DurableError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DurableError::Io(e.to_string()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let mut conn = Connection::open_with_flags(&path, flags)?;
        apply_pragmas(&conn)?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read one record.
    pub fn load(&self, kind: RecordKind, id: &RecordId) -> Result<Option<DurableRecord>, DurableError> {
        let sql = format!(
            "SELECT payload, updated_at FROM {} WHERE {} = ?1",
            table(kind),
            id_column(kind)
        );
        let conn = self.lock();
        let row = conn
            .query_row(&sql, [id_param(id)], |row| {
                let payload: String = row.get(0)?;
                let updated_at: i64 = row.get(1)?;
                Ok(DurableRecord {
                    payload: payload.into_bytes(),
                    updated_at: millis_to_timestamp(updated_at),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Upsert every entry of `batch` and record `synced_at` in one transaction.
    ///
    /// `cancelled` is polled before each row and right before commit. On
    /// cancellation or any failure, including a deferred foreign key rejected
    /// at commit, the transaction is rolled back.
    pub fn commit_batch<F>(
        &self,
        batch: &[CacheEntry],
        synced_at: Timestamp,
        cancelled: F,
    ) -> Result<usize, DurableError>
    where
        F: Fn() -> bool,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for entry in batch {
            if cancelled() {
                return Err(DurableError::Cancelled);
            }
            upsert(&tx, entry)?;
        }
        tx.execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_LAST_SYNC, synced_at.timestamp_millis().to_string()],
        )?;
        if cancelled() {
            return Err(DurableError::Cancelled);
        }
        tx.commit()?;
        Ok(batch.len())
    }

    /// Time of the last committed sync batch, if any.
    pub fn last_sync(&self) -> Result<Option<Timestamp>, DurableError> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![META_LAST_SYNC],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(raw) => raw
                .parse::<i64>()
                .map(|ms| Some(millis_to_timestamp(ms)))
                .map_err(|e| DurableError::Db(format!("invalid {}: {}", META_LAST_SYNC, e))),
            None => Ok(None),
        }
    }

    /// Largest integer id stored for `kind`, or 0 when empty.
    pub fn max_int_id(&self, kind: RecordKind) -> Result<i64, DurableError> {
        if kind.id_kind() != IdKind::Int {
            return Ok(0);
        }
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", table(kind));
        let conn = self.lock();
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn count(&self, kind: RecordKind) -> Result<u64, DurableError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table(kind));
        let conn = self.lock();
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Write a transactionally consistent copy of the database to `dest`.
    ///
    /// `dest` must not exist yet.
    pub fn snapshot_to(&self, dest: &Path) -> Result<(), DurableError> {
        let dest = dest
            .to_str()
            .ok_or_else(|| DurableError::Io(format!("non-UTF-8 snapshot path: {}", dest.display())))?;
        let conn = self.lock();
        conn.execute("VACUUM INTO ?1", params![dest])?;
        Ok(())
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<(), DurableError> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| DurableError::from(err))
    }
}

fn id_param(id: &RecordId) -> &dyn ToSql {
    match id {
        RecordId::Int(value) => value,
        RecordId::Key(key) => key,
    }
}

/// Integer reference mirrored from the payload into a foreign-key column.
fn reference_value(entry: &CacheEntry) -> Result<Option<i64>, DurableError> {
    let Some((field, _)) = entry.kind.reference() else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_slice(&entry.payload)
        .map_err(|e| DurableError::Db(format!("{} {}: {}", entry.kind, entry.id, e)))?;
    Ok(value.get(field).and_then(serde_json::Value::as_i64))
}

fn upsert(tx: &rusqlite::Transaction<'_>, entry: &CacheEntry) -> Result<(), DurableError> {
    let payload = std::str::from_utf8(&entry.payload)
        .map_err(|e| DurableError::Db(format!("{} {}: {}", entry.kind, entry.id, e)))?;
    let updated_at = entry.last_modified.timestamp_millis();
    let id = id_param(&entry.id);
    match entry.kind {
        RecordKind::Profile | RecordKind::Company => {
            let sql = format!(
                "INSERT INTO {} (id, payload, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                table(entry.kind)
            );
            tx.execute(&sql, params![id, payload, updated_at])?;
        }
        RecordKind::Job => {
            tx.execute(
                "INSERT INTO jobs (id, company_id, payload, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     company_id = excluded.company_id,
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![id, reference_value(entry)?, payload, updated_at],
            )?;
        }
        RecordKind::MatchResult => {
            tx.execute(
                "INSERT INTO match_results (key, job_id, payload, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                     job_id = excluded.job_id,
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![id, reference_value(entry)?, payload, updated_at],
            )?;
        }
    }
    Ok(())
}

/// Applies pragmas required for durability.
fn apply_pragmas(conn: &Connection) -> Result<(), DurableError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA synchronous = FULL;")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Creates the schema or validates the existing version.
fn initialize_schema(conn: &mut Connection) -> Result<(), DurableError> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    let version: Option<String> = tx
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            params![META_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                params![META_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
            )?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS profiles (
                    id INTEGER PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS companies (
                    id INTEGER PRIMARY KEY,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY,
                    company_id INTEGER
                        REFERENCES companies(id) DEFERRABLE INITIALLY DEFERRED,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_company_id ON jobs (company_id);
                CREATE TABLE IF NOT EXISTS match_results (
                    key TEXT PRIMARY KEY,
                    job_id INTEGER NOT NULL
                        REFERENCES jobs(id) DEFERRABLE INITIALLY DEFERRED,
                    payload TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_match_results_job_id ON match_results (job_id);",
            )?;
        }
        Some(raw) if raw == SCHEMA_VERSION.to_string() => {}
        Some(raw) => {
            return Err(DurableError::VersionMismatch(format!(
                "expected {}, found {}",
                SCHEMA_VERSION, raw
            )));
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (DurableStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = DurableStore::open(temp_dir.path().join("store.db"))
            .expect("DurableStore creation should succeed");
        (store, temp_dir)
    }

    fn entry(kind: RecordKind, id: RecordId, payload: &str) -> CacheEntry {
        CacheEntry {
            kind,
            id,
            payload: payload.as_bytes().to_vec(),
            dirty: true,
            revision: 1,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_commit_and_load() {
        let (store, _temp) = create_test_store();
        let batch = vec![
            entry(RecordKind::Company, RecordId::Int(1), r#"{"id":1,"name":"Acme"}"#),
            entry(RecordKind::Job, RecordId::Int(1), r#"{"id":1,"company_id":1,"title":"Engineer"}"#),
        ];
        let committed = store
            .commit_batch(&batch, Utc::now(), || false)
            .expect("commit should succeed");
        assert_eq!(committed, 2);

        let loaded = store
            .load(RecordKind::Job, &RecordId::Int(1))
            .expect("load should succeed")
            .expect("row should exist");
        assert_eq!(loaded.payload, batch[1].payload);
        assert!(store.last_sync().expect("last_sync should succeed").is_some());
    }

    #[test]
    fn test_upsert_overwrites() {
        let (store, _temp) = create_test_store();
        for name in ["first", "second"] {
            let payload = format!(r#"{{"id":3,"name":"{}"}}"#, name);
            store
                .commit_batch(&[entry(RecordKind::Profile, RecordId::Int(3), &payload)], Utc::now(), || false)
                .expect("commit should succeed");
        }
        let loaded = store
            .load(RecordKind::Profile, &RecordId::Int(3))
            .expect("load should succeed")
            .expect("row should exist");
        assert!(String::from_utf8_lossy(&loaded.payload).contains("second"));
        assert_eq!(store.count(RecordKind::Profile).expect("count should succeed"), 1);
    }

    #[test]
    fn test_deferred_foreign_key_rolls_back_batch() {
        let (store, _temp) = create_test_store();
        let batch = vec![
            entry(RecordKind::Profile, RecordId::Int(1), r#"{"id":1}"#),
            entry(RecordKind::Job, RecordId::Int(1), r#"{"id":1,"company_id":99}"#),
        ];
        let err = store
            .commit_batch(&batch, Utc::now(), || false)
            .expect_err("commit should fail on missing company");
        assert!(matches!(err, DurableError::Constraint(_)), "{:?}", err);
        assert_eq!(store.count(RecordKind::Profile).expect("count should succeed"), 0);
        assert!(store.last_sync().expect("last_sync should succeed").is_none());
    }

    #[test]
    fn test_forward_reference_within_batch_commits() {
        let (store, _temp) = create_test_store();
        // The match result precedes its job in key order.
        let batch = vec![
            entry(RecordKind::MatchResult, RecordId::from("job-1:profile-1"), r#"{"key":"job-1:profile-1","job_id":1}"#),
            entry(RecordKind::Job, RecordId::Int(1), r#"{"id":1}"#),
        ];
        store
            .commit_batch(&batch, Utc::now(), || false)
            .expect("commit should succeed");
        assert_eq!(store.count(RecordKind::MatchResult).expect("count should succeed"), 1);
    }

    #[test]
    fn test_cancelled_commit_writes_nothing() {
        let (store, _temp) = create_test_store();
        let batch = vec![entry(RecordKind::Company, RecordId::Int(1), r#"{"id":1}"#)];
        let err = store
            .commit_batch(&batch, Utc::now(), || true)
            .expect_err("commit should be cancelled");
        assert!(matches!(err, DurableError::Cancelled));
        assert_eq!(store.count(RecordKind::Company).expect("count should succeed"), 0);
    }

    #[test]
    fn test_max_int_id() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.max_int_id(RecordKind::Job).expect("max should succeed"), 0);
        let batch = vec![
            entry(RecordKind::Job, RecordId::Int(4), r#"{"id":4}"#),
            entry(RecordKind::Job, RecordId::Int(9), r#"{"id":9}"#),
        ];
        store
            .commit_batch(&batch, Utc::now(), || false)
            .expect("commit should succeed");
        assert_eq!(store.max_int_id(RecordKind::Job).expect("max should succeed"), 9);
        assert_eq!(store.max_int_id(RecordKind::MatchResult).expect("max should succeed"), 0);
    }

    #[test]
    fn test_snapshot_is_openable() {
        let (store, temp) = create_test_store();
        store
            .commit_batch(&[entry(RecordKind::Company, RecordId::Int(1), r#"{"id":1}"#)], Utc::now(), || false)
            .expect("commit should succeed");
        let dest = temp.path().join("snapshot.db");
        store.snapshot_to(&dest).expect("snapshot should succeed");

        let copy = DurableStore::open(&dest).expect("snapshot should open");
        assert_eq!(copy.count(RecordKind::Company).expect("count should succeed"), 1);
    }

    #[test]
    fn test_reopen_keeps_rows_and_rejects_unknown_version() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let path = temp_dir.path().join("store.db");
        {
            let store = DurableStore::open(&path).expect("open should succeed");
            store
                .commit_batch(&[entry(RecordKind::Profile, RecordId::Int(1), r#"{"id":1}"#)], Utc::now(), || false)
                .expect("commit should succeed");
            store.close().expect("close should succeed");
        }
        {
            let store = DurableStore::open(&path).expect("reopen should succeed");
            assert_eq!(store.count(RecordKind::Profile).expect("count should succeed"), 1);
            store
                .lock()
                .execute("UPDATE store_meta SET value = '99' WHERE key = 'schema_version'", [])
                .expect("update should succeed");
            store.close().expect("close should succeed");
        }
        let err = DurableStore::open(&path).err().expect("open should fail");
        assert!(matches!(err, DurableError::VersionMismatch(_)));
    }
}
