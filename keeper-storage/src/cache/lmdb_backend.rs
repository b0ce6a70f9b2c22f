//! LMDB-backed working copy of one tenant's records.
//!
//! Uses the heed crate (Rust bindings for LMDB). The environment lives on
//! disk under the tenant directory, so dirty entries survive a crash and are
//! flushed by the next sync after reopen.
//!
//! # Databases
//!
//! - `entries`: [`RecordKey`] bytes to `[flags: 1][revision: 8 LE][last_modified ms: 8 LE][json]`
//! - `dirty`: [`RecordKey`] bytes to the revision (8 LE) that made the entry dirty
//! - `meta`: store-wide revision counter and per-kind id cursors
//!
//! Every mutation runs in a single write transaction, so an entry, its dirty
//! marker, the revision counter and the id cursor never disagree.
//!
//! # Reclamation
//!
//! The map size bounds the working set, not the tenant's data. When a write
//! hits `MDB_MAP_FULL`, the oldest half of the clean entries (by
//! `last_modified`) is deleted and the write is retried once. Entries in the
//! `dirty` index are never reclaimed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use keeper_core::{RecordId, RecordKind, StoreError, Timestamp};

use super::key::RecordKey;

/// Flag bit marking an entry as not yet durably committed.
const FLAG_DIRTY: u8 = 0b0000_0001;

/// Length of the value header preceding the JSON payload.
const HEADER_LEN: usize = 17;

const META_REVISION: &[u8] = b"rev";

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored value or key could not be decoded.
    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    /// The map is full and holds no clean entry that could be reclaimed.
    #[error("Cache map full: every cached entry is dirty, sync before writing more")]
    MapFull,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CacheError> for StoreError {
    fn from(e: CacheError) -> Self {
        StoreError::Cache(e.to_string())
    }
}

fn txn_err(e: heed::Error) -> CacheError {
    match e {
        heed::Error::Mdb(heed::MdbError::MapFull) => CacheError::MapFull,
        e => CacheError::Transaction(e.to_string()),
    }
}

/// One cached record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub kind: RecordKind,
    pub id: RecordId,
    /// JSON representation of the record.
    pub payload: Vec<u8>,
    pub dirty: bool,
    pub revision: u64,
    pub last_modified: Timestamp,
}

impl CacheEntry {
    fn encode_value(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(if self.dirty { FLAG_DIRTY } else { 0 });
        bytes.extend_from_slice(&self.revision.to_le_bytes());
        bytes.extend_from_slice(&self.last_modified.timestamp_millis().to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn decode(key: RecordKey, value: &[u8]) -> Result<Self, CacheError> {
        if value.len() < HEADER_LEN {
            return Err(CacheError::Corrupt(format!(
                "{} {}: value shorter than header",
                key.kind(),
                key.id()
            )));
        }
        let revision = read_u64(&value[1..9]);
        let millis = read_u64(&value[9..17]) as i64;
        let last_modified = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let kind = key.kind();
        Ok(Self {
            kind,
            id: key.id().clone(),
            payload: value[HEADER_LEN..].to_vec(),
            dirty: value[0] & FLAG_DIRTY != 0,
            revision,
            last_modified,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Result of a dirty write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Final id of the record, allocated when the caller passed `Int(0)`.
    pub id: RecordId,
    pub revision: u64,
}

/// A dirty entry captured for a sync batch.
pub type DirtyEntry = CacheEntry;

/// One tenant's LMDB environment.
pub struct TenantCache {
    env: Env,
    entries: Database<Bytes, Bytes>,
    dirty: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    path: PathBuf,
}

impl TenantCache {
    /// Open or create the cache environment in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the environment
    /// is already open in this process, or a database cannot be created.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(|e| CacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let entries = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(|e| CacheError::DbOpen(e.to_string()))?;
        let dirty = env
            .create_database(&mut wtxn, Some("dirty"))
            .map_err(|e| CacheError::DbOpen(e.to_string()))?;
        let meta = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| CacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            entries,
            dirty,
            meta,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one entry.
    pub fn get(&self, key: &RecordKey) -> Result<Option<CacheEntry>, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.entries.get(&rtxn, &key.encode()).map_err(txn_err)? {
            Some(value) => CacheEntry::decode(key.clone(), value).map(Some),
            None => Ok(None),
        }
    }

    /// Write a record and mark it dirty.
    ///
    /// An unassigned id (`Int(0)`) is replaced by the kind's next id before
    /// `encode` runs, so the payload always carries the final id. An explicit
    /// integer id advances the cursor past it.
    pub fn put_dirty<E, F>(
        &self,
        kind: RecordKind,
        id: RecordId,
        now: Timestamp,
        encode: F,
    ) -> Result<PutOutcome, E>
    where
        E: From<CacheError>,
        F: FnOnce(&RecordId) -> Result<Vec<u8>, E>,
    {
        let mut encode = Some(encode);
        // Payload kept across a reclaim-and-retry, keyed by the id it embeds.
        let mut staged: Option<(RecordId, Vec<u8>)> = None;
        let mut reclaimed = false;

        loop {
            let mut wtxn = self.env.write_txn().map_err(txn_err)?;
            let final_id = self.allocate_id(&mut wtxn, kind, &id)?;
            let payload = match staged.take() {
                Some((staged_id, payload)) if staged_id == final_id => payload,
                _ => match encode.take() {
                    Some(encode) => encode(&final_id)?,
                    None => {
                        return Err(CacheError::Corrupt(format!(
                            "id cursor for {} moved during reclaim",
                            kind
                        ))
                        .into())
                    }
                },
            };

            match self.write_dirty(wtxn, kind, &final_id, now, &payload) {
                Ok(revision) => {
                    return Ok(PutOutcome {
                        id: final_id,
                        revision,
                    })
                }
                Err(CacheError::MapFull) if !reclaimed => {
                    reclaimed = true;
                    if self.reclaim()? == 0 {
                        return Err(CacheError::MapFull.into());
                    }
                    staged = Some((final_id, payload));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn allocate_id(
        &self,
        wtxn: &mut RwTxn,
        kind: RecordKind,
        id: &RecordId,
    ) -> Result<RecordId, CacheError> {
        Ok(match id {
            RecordId::Int(0) => {
                let next = self.read_cursor(wtxn, kind)?;
                self.write_cursor(wtxn, kind, next + 1)?;
                RecordId::Int(next)
            }
            RecordId::Int(explicit) => {
                if *explicit >= self.read_cursor(wtxn, kind)? {
                    self.write_cursor(wtxn, kind, explicit + 1)?;
                }
                RecordId::Int(*explicit)
            }
            key => key.clone(),
        })
    }

    /// Store a dirty entry and commit. Consumes the transaction so a failed
    /// write is always aborted.
    fn write_dirty(
        &self,
        mut wtxn: RwTxn,
        kind: RecordKind,
        id: &RecordId,
        now: Timestamp,
        payload: &[u8],
    ) -> Result<u64, CacheError> {
        let revision = self.bump_revision(&mut wtxn)?;
        let encoded_key = RecordKey::new(kind, id.clone()).encode();
        let entry = CacheEntry {
            kind,
            id: id.clone(),
            payload: payload.to_vec(),
            dirty: true,
            revision,
            last_modified: now,
        };

        self.entries
            .put(&mut wtxn, &encoded_key, &entry.encode_value())
            .map_err(txn_err)?;
        self.dirty
            .put(&mut wtxn, &encoded_key, &revision.to_le_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(revision)
    }

    /// Insert a clean entry loaded from the durable layer, unless one exists.
    ///
    /// Returns whether the entry was inserted. An existing entry always wins,
    /// since it is at least as fresh as the durable copy. A full map that
    /// cannot be reclaimed skips the insert.
    pub fn fill(
        &self,
        kind: RecordKind,
        id: RecordId,
        payload: Vec<u8>,
        last_modified: Timestamp,
    ) -> Result<bool, CacheError> {
        let key = RecordKey::new(kind, id.clone()).encode();
        let entry = CacheEntry {
            kind,
            id,
            payload,
            dirty: false,
            revision: 0,
            last_modified,
        };
        match self.with_reclaim(|| self.insert_clean(&key, &entry)) {
            Err(CacheError::MapFull) => Ok(false),
            other => other,
        }
    }

    fn insert_clean(&self, key: &[u8], entry: &CacheEntry) -> Result<bool, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self.entries.get(&wtxn, key).map_err(txn_err)?.is_some() {
            return Ok(false);
        }
        let revision = self.bump_revision(&mut wtxn)?;
        let entry = CacheEntry {
            revision,
            ..entry.clone()
        };
        self.entries
            .put(&mut wtxn, key, &entry.encode_value())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    /// Every dirty entry, ordered by kind then id.
    pub fn dirty_snapshot(&self) -> Result<Vec<DirtyEntry>, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut snapshot = Vec::new();
        for item in self.dirty.iter(&rtxn).map_err(txn_err)? {
            let (raw_key, _) = item.map_err(txn_err)?;
            let key = RecordKey::decode(raw_key)
                .ok_or_else(|| CacheError::Corrupt("undecodable dirty key".to_string()))?;
            match self.entries.get(&rtxn, raw_key).map_err(txn_err)? {
                Some(value) => snapshot.push(CacheEntry::decode(key, value)?),
                None => {
                    return Err(CacheError::Corrupt(format!(
                        "dirty marker without entry: {} {}",
                        key.kind(),
                        key.id()
                    )))
                }
            }
        }
        Ok(snapshot)
    }

    /// Clear the dirty marker of every `(key, revision)` pair whose entry was
    /// not rewritten since the snapshot. Returns how many were cleared.
    pub fn clear_dirty(&self, flushed: &[(RecordKey, u64)]) -> Result<usize, CacheError> {
        self.with_reclaim(|| self.clear_dirty_once(flushed))
    }

    fn clear_dirty_once(&self, flushed: &[(RecordKey, u64)]) -> Result<usize, CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut cleared = 0;
        for (key, revision) in flushed {
            let encoded_key = key.encode();
            let current = match self.dirty.get(&wtxn, &encoded_key).map_err(txn_err)? {
                Some(raw) if raw.len() == 8 => read_u64(raw),
                _ => continue,
            };
            if current != *revision {
                continue;
            }
            let entry = match self.entries.get(&wtxn, &encoded_key).map_err(txn_err)? {
                Some(value) => CacheEntry::decode(key.clone(), value)?,
                None => continue,
            };
            let clean = CacheEntry {
                dirty: false,
                ..entry
            };
            self.entries
                .put(&mut wtxn, &encoded_key, &clean.encode_value())
                .map_err(txn_err)?;
            self.dirty.delete(&mut wtxn, &encoded_key).map_err(txn_err)?;
            cleared += 1;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(cleared)
    }

    /// Run `op`, and on a full map reclaim clean entries and run it once more.
    fn with_reclaim<T>(
        &self,
        op: impl Fn() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        match op() {
            Err(CacheError::MapFull) => {
                if self.reclaim()? == 0 {
                    return Err(CacheError::MapFull);
                }
                op()
            }
            other => other,
        }
    }

    /// Delete the older half of the clean entries.
    fn reclaim(&self) -> Result<usize, CacheError> {
        let clean = self.clean_entries_by_age()?;
        let evicted = self.delete_entries(&clean[..clean.len().div_ceil(2)])?;
        tracing::debug!(
            cache = %self.path.display(),
            evicted,
            "Cache map full, reclaimed clean entries"
        );
        Ok(evicted)
    }

    /// Delete every clean entry. Dirty entries are kept. Returns how many
    /// entries were dropped.
    pub fn evict_clean(&self) -> Result<usize, CacheError> {
        let clean = self.clean_entries_by_age()?;
        self.delete_entries(&clean)
    }

    /// Keys of clean entries, oldest `last_modified` first.
    fn clean_entries_by_age(&self) -> Result<Vec<Vec<u8>>, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut clean: Vec<(i64, Vec<u8>)> = Vec::new();
        for item in self.entries.iter(&rtxn).map_err(txn_err)? {
            let (key, value) = item.map_err(txn_err)?;
            if value.len() < HEADER_LEN || value[0] & FLAG_DIRTY != 0 {
                continue;
            }
            if self.dirty.get(&rtxn, key).map_err(txn_err)?.is_some() {
                continue;
            }
            clean.push((read_u64(&value[9..17]) as i64, key.to_vec()));
        }
        clean.sort();
        Ok(clean.into_iter().map(|(_, key)| key).collect())
    }

    fn delete_entries(&self, keys: &[Vec<u8>]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for key in keys {
            self.entries.delete(&mut wtxn, key).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(keys.len())
    }

    pub fn dirty_count(&self) -> Result<u64, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.dirty.len(&rtxn).map_err(txn_err)
    }

    pub fn entry_count(&self) -> Result<u64, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.entries.len(&rtxn).map_err(txn_err)
    }

    /// Raise the id cursor of `kind` to at least `next`.
    ///
    /// Used at open so ids never collide with records that only exist in the
    /// durable layer.
    pub fn seed_cursor(&self, kind: RecordKind, next: i64) -> Result<(), CacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if next > self.read_cursor(&wtxn, kind)? {
            self.write_cursor(&mut wtxn, kind, next)?;
        }
        wtxn.commit().map_err(txn_err)
    }

    /// Next id that would be allocated for `kind`.
    #[cfg(test)]
    fn peek_cursor(&self, kind: RecordKind) -> Result<i64, CacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.read_cursor(&rtxn, kind)
    }

    /// Close the environment and wait until LMDB has released it, so the same
    /// path can be reopened in this process.
    pub fn close(self) {
        let Self { env, .. } = self;
        env.prepare_for_closing().wait();
    }

    fn read_cursor(&self, txn: &RoTxn, kind: RecordKind) -> Result<i64, CacheError> {
        match self.meta.get(txn, &cursor_key(kind)).map_err(txn_err)? {
            Some(raw) if raw.len() == 8 => Ok(read_u64(raw) as i64),
            Some(_) => Err(CacheError::Corrupt(format!("id cursor for {}", kind))),
            None => Ok(1),
        }
    }

    fn write_cursor(&self, txn: &mut RwTxn, kind: RecordKind, next: i64) -> Result<(), CacheError> {
        self.meta
            .put(txn, &cursor_key(kind), &(next as u64).to_le_bytes())
            .map_err(txn_err)
    }

    fn bump_revision(&self, txn: &mut RwTxn) -> Result<u64, CacheError> {
        let current = match self.meta.get(&*txn, META_REVISION).map_err(txn_err)? {
            Some(raw) if raw.len() == 8 => read_u64(raw),
            _ => 0,
        };
        let next = current + 1;
        self.meta
            .put(txn, META_REVISION, &next.to_le_bytes())
            .map_err(txn_err)?;
        Ok(next)
    }
}

fn cursor_key(kind: RecordKind) -> [u8; 6] {
    let mut key = *b"next:\0";
    key[5] = kind.tag();
    key
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_cache() -> (TenantCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache = TenantCache::open(temp_dir.path().join("cache"), 16)
            .expect("TenantCache creation should succeed");
        (cache, temp_dir)
    }

    fn put(cache: &TenantCache, kind: RecordKind, id: RecordId, body: &str) -> PutOutcome {
        cache
            .put_dirty::<CacheError, _>(kind, id, Utc::now(), |_| Ok(body.as_bytes().to_vec()))
            .expect("put_dirty should succeed")
    }

    #[test]
    fn test_put_and_get() {
        let (cache, _temp) = create_test_cache();
        let outcome = put(&cache, RecordKind::Job, RecordId::Int(0), r#"{"title":"Engineer"}"#);
        assert_eq!(outcome.id, RecordId::Int(1));

        let entry = cache
            .get(&RecordKey::new(RecordKind::Job, RecordId::Int(1)))
            .expect("get should succeed")
            .expect("entry should exist");
        assert!(entry.dirty);
        assert_eq!(entry.revision, outcome.revision);
        assert_eq!(entry.payload, br#"{"title":"Engineer"}"#.to_vec());
    }

    #[test]
    fn test_get_nonexistent() {
        let (cache, _temp) = create_test_cache();
        let result = cache
            .get(&RecordKey::new(RecordKind::Profile, RecordId::Int(9)))
            .expect("get should succeed");
        assert!(result.is_none());
    }

    #[test]
    fn test_ids_allocated_per_kind() {
        let (cache, _temp) = create_test_cache();
        assert_eq!(put(&cache, RecordKind::Job, RecordId::Int(0), "{}").id, RecordId::Int(1));
        assert_eq!(put(&cache, RecordKind::Job, RecordId::Int(0), "{}").id, RecordId::Int(2));
        assert_eq!(
            put(&cache, RecordKind::Company, RecordId::Int(0), "{}").id,
            RecordId::Int(1)
        );
    }

    #[test]
    fn test_explicit_id_advances_cursor() {
        let (cache, _temp) = create_test_cache();
        put(&cache, RecordKind::Profile, RecordId::Int(10), "{}");
        assert_eq!(
            put(&cache, RecordKind::Profile, RecordId::Int(0), "{}").id,
            RecordId::Int(11)
        );
        put(&cache, RecordKind::Profile, RecordId::Int(3), "{}");
        assert_eq!(cache.peek_cursor(RecordKind::Profile).expect("peek should succeed"), 12);
    }

    #[test]
    fn test_encode_sees_allocated_id() {
        let (cache, _temp) = create_test_cache();
        cache
            .put_dirty::<CacheError, _>(RecordKind::Company, RecordId::Int(0), Utc::now(), |id| {
                Ok(format!("{{\"id\":{}}}", id).into_bytes())
            })
            .expect("put_dirty should succeed");
        let entry = cache
            .get(&RecordKey::new(RecordKind::Company, RecordId::Int(1)))
            .expect("get should succeed")
            .expect("entry should exist");
        assert_eq!(entry.payload, br#"{"id":1}"#.to_vec());
    }

    #[test]
    fn test_failed_encode_writes_nothing() {
        let (cache, _temp) = create_test_cache();
        let result = cache.put_dirty(RecordKind::Job, RecordId::Int(0), Utc::now(), |_| {
            Err(CacheError::Corrupt("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(cache.entry_count().expect("count should succeed"), 0);
        assert_eq!(cache.peek_cursor(RecordKind::Job).expect("peek should succeed"), 1);
    }

    #[test]
    fn test_clear_dirty_respects_revision() {
        let (cache, _temp) = create_test_cache();
        put(&cache, RecordKind::Job, RecordId::Int(1), "v1");
        put(&cache, RecordKind::Job, RecordId::Int(2), "v1");

        let snapshot = cache.dirty_snapshot().expect("snapshot should succeed");
        assert_eq!(snapshot.len(), 2);

        // Entry 2 is rewritten after the snapshot.
        put(&cache, RecordKind::Job, RecordId::Int(2), "v2");

        let flushed: Vec<_> = snapshot
            .iter()
            .map(|e| (RecordKey::new(e.kind, e.id.clone()), e.revision))
            .collect();
        let cleared = cache.clear_dirty(&flushed).expect("clear should succeed");
        assert_eq!(cleared, 1);
        assert_eq!(cache.dirty_count().expect("count should succeed"), 1);

        let first = cache
            .get(&RecordKey::new(RecordKind::Job, RecordId::Int(1)))
            .expect("get should succeed")
            .expect("entry should exist");
        assert!(!first.dirty);
        let second = cache
            .get(&RecordKey::new(RecordKind::Job, RecordId::Int(2)))
            .expect("get should succeed")
            .expect("entry should exist");
        assert!(second.dirty);
        assert_eq!(second.payload, b"v2".to_vec());
    }

    #[test]
    fn test_fill_never_overwrites() {
        let (cache, _temp) = create_test_cache();
        put(&cache, RecordKind::Company, RecordId::Int(1), "fresh");
        let inserted = cache
            .fill(RecordKind::Company, RecordId::Int(1), b"stale".to_vec(), Utc::now())
            .expect("fill should succeed");
        assert!(!inserted);

        let inserted = cache
            .fill(RecordKind::Company, RecordId::Int(2), b"loaded".to_vec(), Utc::now())
            .expect("fill should succeed");
        assert!(inserted);
        let entry = cache
            .get(&RecordKey::new(RecordKind::Company, RecordId::Int(2)))
            .expect("get should succeed")
            .expect("entry should exist");
        assert!(!entry.dirty);
        assert_eq!(cache.dirty_count().expect("count should succeed"), 1);
    }

    #[test]
    fn test_dirty_entries_survive_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let path = temp_dir.path().join("cache");
        {
            let cache = TenantCache::open(&path, 16).expect("open should succeed");
            put(&cache, RecordKind::MatchResult, RecordId::from("job-1:profile-1"), "{}");
            put(&cache, RecordKind::Job, RecordId::Int(0), "{}");
            cache.close();
        }
        let cache = TenantCache::open(&path, 16).expect("reopen should succeed");
        assert_eq!(cache.dirty_count().expect("count should succeed"), 2);
        assert_eq!(cache.peek_cursor(RecordKind::Job).expect("peek should succeed"), 2);
        let revision = put(&cache, RecordKind::Job, RecordId::Int(0), "{}").revision;
        assert_eq!(revision, 3);
    }

    fn put_and_clean(cache: &TenantCache, id: i64, body: &[u8]) {
        let outcome = cache
            .put_dirty::<CacheError, _>(RecordKind::Company, RecordId::Int(id), Utc::now(), |_| {
                Ok(body.to_vec())
            })
            .expect("put_dirty should succeed");
        let key = RecordKey::new(RecordKind::Company, RecordId::Int(id));
        cache
            .clear_dirty(&[(key, outcome.revision)])
            .expect("clear should succeed");
    }

    #[test]
    fn test_full_map_reclaims_clean_entries() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache = TenantCache::open(temp_dir.path().join("cache"), 1)
            .expect("open should succeed");
        let body = vec![b'x'; 1500];

        // Several times the map size, cleaned after every write.
        for id in 1..=3000 {
            put_and_clean(&cache, id, &body);
        }

        assert_eq!(cache.dirty_count().expect("count should succeed"), 0);
        assert!(cache.entry_count().expect("count should succeed") < 3000);
        let newest = cache
            .get(&RecordKey::new(RecordKind::Company, RecordId::Int(3000)))
            .expect("get should succeed");
        assert!(newest.is_some());
    }

    #[test]
    fn test_full_map_of_dirty_entries_is_reported() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache = TenantCache::open(temp_dir.path().join("cache"), 1)
            .expect("open should succeed");
        let body = vec![b'x'; 1500];

        let mut written = 0u64;
        let mut failure = None;
        for id in 1..=3000 {
            match cache.put_dirty::<CacheError, _>(
                RecordKind::Job,
                RecordId::Int(id),
                Utc::now(),
                |_| Ok(body.clone()),
            ) {
                Ok(_) => written += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        assert!(matches!(failure, Some(CacheError::MapFull)), "{:?}", failure);
        assert!(written > 0);
        assert_eq!(cache.dirty_count().expect("count should succeed"), written);
    }

    #[test]
    fn test_evict_clean_keeps_dirty_entries() {
        let (cache, _temp) = create_test_cache();
        put_and_clean(&cache, 1, b"clean");
        put(&cache, RecordKind::Company, RecordId::Int(2), "dirty");
        cache
            .fill(RecordKind::Job, RecordId::Int(7), b"loaded".to_vec(), Utc::now())
            .expect("fill should succeed");

        assert_eq!(cache.evict_clean().expect("evict should succeed"), 2);
        assert_eq!(cache.entry_count().expect("count should succeed"), 1);
        let kept = cache
            .get(&RecordKey::new(RecordKind::Company, RecordId::Int(2)))
            .expect("get should succeed")
            .expect("dirty entry should survive");
        assert!(kept.dirty);
    }

    #[test]
    fn test_seed_cursor_only_raises() {
        let (cache, _temp) = create_test_cache();
        cache.seed_cursor(RecordKind::Job, 5).expect("seed should succeed");
        cache.seed_cursor(RecordKind::Job, 2).expect("seed should succeed");
        assert_eq!(cache.peek_cursor(RecordKind::Job).expect("peek should succeed"), 5);
    }
}
