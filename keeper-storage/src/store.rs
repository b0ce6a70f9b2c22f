//! Per-tenant store: typed get/save over the cache, sync into the durable
//! layer, and close.
//!
//! Writes land in the tenant's LMDB cache and are marked dirty; reads are
//! served from the cache and fall back to SQLite on a miss. The sync engine
//! (see [`crate::sync`]) moves dirty entries into SQLite.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use keeper_core::{
    Company, ConfigError, IdKind, Job, KeeperConfig, MatchResult, Profile, Record, RecordId,
    RecordKind, StoreError, StoreResult, TenantId, Timestamp, DEFAULT_CACHE_MAP_SIZE_MB,
    DEFAULT_SYNC_INTERVAL,
};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::backup::BackupSink;
use crate::cache::{RecordKey, TenantCache, MAX_KEY_LEN};
use crate::durable::{DurableError, DurableStore};
use crate::sync::{BackgroundSync, SyncContext, SyncReport};

/// Shared handle to an open tenant store.
pub type TenantStoreHandle = Arc<TenantStore>;

// ============================================================================
// OPTIONS
// ============================================================================

/// Options for [`TenantStore::open_with`].
pub struct StoreOptions {
    pub tenant_id: TenantId,
    /// Base data directory. The tenant's files live in a subdirectory.
    pub data_dir: PathBuf,
    /// Remote backup adapter, used only when `cloud_mode` is on.
    pub backup: Option<Arc<dyn BackupSink>>,
    pub cloud_mode: bool,
    /// Background sync cadence. `None` disables the background task.
    pub sync_interval: Option<Duration>,
    pub cache_map_size_mb: usize,
}

impl StoreOptions {
    /// Default options: background sync every 30 seconds, no backup.
    pub fn new(tenant_id: TenantId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            tenant_id,
            data_dir: data_dir.into(),
            backup: None,
            cloud_mode: false,
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
            cache_map_size_mb: DEFAULT_CACHE_MAP_SIZE_MB,
        }
    }

    /// Options without a background task. Syncs happen only on demand.
    pub fn ephemeral(tenant_id: TenantId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            sync_interval: None,
            ..Self::new(tenant_id, data_dir)
        }
    }

    pub fn from_config(
        tenant_id: TenantId,
        config: &KeeperConfig,
        backup: Option<Arc<dyn BackupSink>>,
    ) -> Self {
        Self {
            tenant_id,
            data_dir: config.data_dir.clone(),
            backup,
            cloud_mode: config.cloud_mode,
            sync_interval: config.sync_interval,
            cache_map_size_mb: config.cache_map_size_mb,
        }
    }

    /// Enable cloud mode with `sink` as the backup adapter.
    pub fn with_backup(mut self, sink: Arc<dyn BackupSink>) -> Self {
        self.backup = Some(sink);
        self.cloud_mode = true;
        self
    }

    pub fn with_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.sync_interval = interval;
        self
    }
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    syncs: AtomicU64,
    failed_syncs: AtomicU64,
    backup_failures: AtomicU64,
}

impl StoreCounters {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_sync(&self) {
        self.failed_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backup_failure(&self) {
        self.backup_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics of one tenant store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub tenant_id: TenantId,
    pub instance_id: Uuid,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Misses that were served from the durable layer and cached.
    pub cache_fills: u64,
    pub entries: u64,
    pub dirty_entries: u64,
    pub syncs: u64,
    pub failed_syncs: u64,
    pub backup_failures: u64,
    pub last_sync: Timestamp,
    /// Rows in the durable layer, across all kinds.
    pub durable_records: u64,
    /// Last sync committed to the durable file, by any instance.
    pub durable_last_sync: Option<Timestamp>,
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Open cache environment and durable connection.
pub(crate) struct Resources {
    pub(crate) cache: TenantCache,
    pub(crate) durable: Arc<DurableStore>,
}

/// State shared between a [`TenantStore`] and its background sync task.
pub(crate) struct StoreShared {
    pub(crate) tenant_id: TenantId,
    pub(crate) instance_id: Uuid,
    /// `<data_dir>/<tenant segment>`.
    pub(crate) root: PathBuf,
    /// Guards every cache mutation, read and dirty snapshot. `None` once
    /// closed.
    pub(crate) resources: AsyncMutex<Option<Resources>>,
    /// Serializes syncs.
    pub(crate) sync_gate: AsyncMutex<()>,
    pub(crate) last_sync: RwLock<Timestamp>,
    pub(crate) backup: Option<Arc<dyn BackupSink>>,
    pub(crate) counters: StoreCounters,
    pub(crate) closed: AtomicBool,
}

impl StoreShared {
    pub(crate) fn open_resources<'a>(&self, slot: &'a Option<Resources>) -> StoreResult<&'a Resources> {
        slot.as_ref().ok_or_else(|| StoreError::Closed {
            tenant: self.tenant_id.clone(),
        })
    }

    pub(crate) fn last_sync(&self) -> Timestamp {
        *self.last_sync.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_last_sync(&self, at: Timestamp) {
        *self.last_sync.write().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// Drop the open resources and mark the store closed.
    async fn release(&self) {
        let taken = {
            let mut slot = self.resources.lock().await;
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        let Some(Resources { cache, durable }) = taken else {
            return;
        };

        let joined = tokio::task::spawn_blocking(move || {
            cache.close();
            match Arc::try_unwrap(durable) {
                Ok(store) => store.close(),
                Err(_) => Ok(()),
            }
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(tenant = %self.tenant_id, error = %e, "Durable store did not close cleanly");
            }
            Err(e) => {
                tracing::warn!(tenant = %self.tenant_id, error = %e, "Release worker failed");
            }
        }
    }
}

/// Open the durable file and cache environment under `root`.
fn open_resources_at(root: &Path, cache_map_size_mb: usize) -> StoreResult<Resources> {
    std::fs::create_dir_all(root).map_err(|e| StoreError::Durable(e.to_string()))?;
    let durable = DurableStore::open(root.join("store.db"))?;
    let cache = TenantCache::open(root.join("cache"), cache_map_size_mb)?;

    // Ids allocated from here on must not collide with durable rows the
    // cache has never seen.
    for kind in RecordKind::ALL {
        if kind.id_kind() == IdKind::Int {
            cache.seed_cursor(kind, durable.max_int_id(kind)? + 1)?;
        }
    }

    // The cache holds what this session touches. Clean entries from a
    // previous session are served from the durable layer again on demand.
    let evicted = cache.evict_clean()?;
    if evicted > 0 {
        tracing::debug!(root = %root.display(), evicted, "Dropped clean cache entries at open");
    }

    Ok(Resources {
        cache,
        durable: Arc::new(durable),
    })
}

fn validate_id(kind: RecordKind, id: &RecordId) -> StoreResult<()> {
    let reason = match (kind.id_kind(), id) {
        (IdKind::Int, RecordId::Int(value)) if *value < 0 => {
            format!("negative id {}", value)
        }
        (IdKind::Int, RecordId::Int(_)) => return Ok(()),
        (IdKind::Int, RecordId::Key(_)) => "expected an integer id".to_string(),
        (IdKind::Key, RecordId::Key(key)) if key.is_empty() => "empty key".to_string(),
        (IdKind::Key, RecordId::Key(key)) if key.len() > MAX_KEY_LEN => {
            format!("key is {} bytes, longest allowed is {}", key.len(), MAX_KEY_LEN)
        }
        (IdKind::Key, RecordId::Key(_)) => return Ok(()),
        (IdKind::Key, RecordId::Int(_)) => "expected a string key".to_string(),
    };
    Err(StoreError::InvalidRecord { kind, reason })
}

fn decode<R: Record>(payload: &[u8]) -> StoreResult<R> {
    serde_json::from_slice(payload).map_err(|e| StoreError::Serialization {
        kind: R::KIND,
        reason: e.to_string(),
    })
}

// ============================================================================
// TENANT STORE
// ============================================================================

/// One tenant's isolated store.
///
/// # Example
///
/// ```ignore
/// use keeper_core::{Job, TenantId};
/// use keeper_storage::{SyncContext, TenantStore};
///
/// let store = TenantStore::open(TenantId::new("alice")?, "./data").await?;
/// let mut job = Job { title: "Engineer".into(), ..Default::default() };
/// store.save_job(&mut job).await?;
/// store.sync(&SyncContext::new()).await?;
/// store.close().await?;
/// ```
pub struct TenantStore {
    shared: Arc<StoreShared>,
    background: Mutex<Option<BackgroundSync>>,
}

impl TenantStore {
    /// Open a tenant's store under `data_dir` with default options.
    pub async fn open(tenant_id: TenantId, data_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::open_with(StoreOptions::new(tenant_id, data_dir)).await
    }

    /// Open a tenant's store, creating its files on first use.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Config`] for cloud mode without a backup adapter, a
    ///   zero map size or a zero sync interval
    /// - [`StoreError::Open`] when the durable file or cache environment
    ///   cannot be opened
    pub async fn open_with(options: StoreOptions) -> StoreResult<Self> {
        let StoreOptions {
            tenant_id,
            data_dir,
            backup,
            cloud_mode,
            sync_interval,
            cache_map_size_mb,
        } = options;

        let backup = match (cloud_mode, backup) {
            (true, None) => {
                return Err(ConfigError::MissingRequired {
                    field: "backup adapter".to_string(),
                }
                .into())
            }
            (true, Some(sink)) => Some(sink),
            (false, Some(_)) => {
                tracing::debug!(tenant = %tenant_id, "Backup adapter ignored outside cloud mode");
                None
            }
            (false, None) => None,
        };
        if cache_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if sync_interval == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "sync_interval".to_string(),
                value: "0".to_string(),
                reason: "use None to disable background sync".to_string(),
            }
            .into());
        }

        let root = data_dir.join(tenant_id.path_segment());
        let open_root = root.clone();
        let resources = tokio::task::spawn_blocking(move || {
            open_resources_at(&open_root, cache_map_size_mb)
        })
        .await
        .map_err(|e| StoreError::Open {
            tenant: tenant_id.clone(),
            reason: e.to_string(),
        })?
        .map_err(|e| StoreError::Open {
            tenant: tenant_id.clone(),
            reason: e.to_string(),
        })?;
        let recovered = resources.cache.dirty_count()?;

        let shared = Arc::new(StoreShared {
            tenant_id,
            instance_id: Uuid::now_v7(),
            root,
            resources: AsyncMutex::new(Some(resources)),
            sync_gate: AsyncMutex::new(()),
            last_sync: RwLock::new(Utc::now()),
            backup,
            counters: StoreCounters::default(),
            closed: AtomicBool::new(false),
        });
        let background = sync_interval.and_then(|every| BackgroundSync::spawn(&shared, every));

        tracing::info!(
            tenant = %shared.tenant_id,
            instance = %shared.instance_id,
            root = %shared.root.display(),
            background_sync = background.is_some(),
            recovered_dirty = recovered,
            "Tenant store opened"
        );

        Ok(Self {
            shared,
            background: Mutex::new(background),
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.shared.tenant_id
    }

    /// Identifier of this opened instance, unique per open.
    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    /// Time of the last successful sync, or the open time before the first.
    pub fn last_sync_time(&self) -> Timestamp {
        self.shared.last_sync()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Directory holding this tenant's files.
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Write a record to the cache and mark it dirty.
    ///
    /// An integer id of `0` is replaced by the next id of the record's kind,
    /// and the allocated id is written back into `record`.
    pub async fn save<R: Record>(&self, record: &mut R) -> StoreResult<RecordId> {
        let kind = R::KIND;
        let id = record.record_id();
        validate_id(kind, &id)?;

        let outcome = {
            let slot = self.shared.resources.lock().await;
            let res = self.shared.open_resources(&slot)?;
            let source: &R = record;
            res.cache.put_dirty(kind, id, Utc::now(), |final_id| {
                let mut staged = source.clone();
                if let RecordId::Int(value) = final_id {
                    staged.assign_id(*value);
                }
                serde_json::to_vec(&staged).map_err(|e| StoreError::Serialization {
                    kind,
                    reason: e.to_string(),
                })
            })?
        };

        if let RecordId::Int(value) = &outcome.id {
            record.assign_id(*value);
        }
        Ok(outcome.id)
    }

    /// Read a record, from the cache when present, otherwise from the
    /// durable layer (caching the result).
    pub async fn get<R: Record>(&self, id: impl Into<RecordId>) -> StoreResult<R> {
        let kind = R::KIND;
        let id = id.into();
        validate_id(kind, &id)?;

        let slot = self.shared.resources.lock().await;
        let res = self.shared.open_resources(&slot)?;

        if let Some(entry) = res.cache.get(&RecordKey::new(kind, id.clone()))? {
            self.shared.counters.record_hit();
            return decode(&entry.payload);
        }
        self.shared.counters.record_miss();

        let durable = Arc::clone(&res.durable);
        let lookup = id.clone();
        let loaded = tokio::task::spawn_blocking(move || durable.load(kind, &lookup))
            .await
            .map_err(|e| StoreError::Durable(e.to_string()))??;

        let Some(row) = loaded else {
            return Err(StoreError::NotFound { kind, id });
        };
        let record = decode::<R>(&row.payload)?;
        if res.cache.fill(kind, id.clone(), row.payload, row.updated_at)? {
            self.shared.counters.record_fill();
            tracing::debug!(tenant = %self.shared.tenant_id, kind = %kind, id = %id, "Cache filled from durable store");
        }
        Ok(record)
    }

    pub async fn save_profile(&self, profile: &mut Profile) -> StoreResult<i64> {
        self.save(profile).await?;
        Ok(profile.id)
    }

    pub async fn get_profile(&self, id: i64) -> StoreResult<Profile> {
        self.get(id).await
    }

    pub async fn save_company(&self, company: &mut Company) -> StoreResult<i64> {
        self.save(company).await?;
        Ok(company.id)
    }

    pub async fn get_company(&self, id: i64) -> StoreResult<Company> {
        self.get(id).await
    }

    pub async fn save_job(&self, job: &mut Job) -> StoreResult<i64> {
        self.save(job).await?;
        Ok(job.id)
    }

    pub async fn get_job(&self, id: i64) -> StoreResult<Job> {
        self.get(id).await
    }

    pub async fn save_match_result(&self, result: &mut MatchResult) -> StoreResult<String> {
        self.save(result).await?;
        Ok(result.key.clone())
    }

    pub async fn get_match_result(&self, key: &str) -> StoreResult<MatchResult> {
        self.get(key).await
    }

    /// Flush dirty entries into the durable layer.
    ///
    /// All-or-nothing: on failure every entry stays dirty and
    /// [`TenantStore::last_sync_time`] does not move.
    pub async fn sync(&self, ctx: &SyncContext) -> StoreResult<SyncReport> {
        self.shared.sync(ctx).await
    }

    pub async fn dirty_count(&self) -> StoreResult<u64> {
        let slot = self.shared.resources.lock().await;
        let res = self.shared.open_resources(&slot)?;
        Ok(res.cache.dirty_count()?)
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let (entries, dirty_entries, durable) = {
            let slot = self.shared.resources.lock().await;
            let res = self.shared.open_resources(&slot)?;
            (
                res.cache.entry_count()?,
                res.cache.dirty_count()?,
                Arc::clone(&res.durable),
            )
        };
        let (durable_records, durable_last_sync) = tokio::task::spawn_blocking(move || {
            let mut rows = 0;
            for kind in RecordKind::ALL {
                rows += durable.count(kind)?;
            }
            Ok::<_, DurableError>((rows, durable.last_sync()?))
        })
        .await
        .map_err(|e| StoreError::Durable(e.to_string()))??;
        let counters = &self.shared.counters;
        Ok(StoreStats {
            tenant_id: self.shared.tenant_id.clone(),
            instance_id: self.shared.instance_id,
            cache_hits: counters.hits.load(Ordering::Relaxed),
            cache_misses: counters.misses.load(Ordering::Relaxed),
            cache_fills: counters.fills.load(Ordering::Relaxed),
            entries,
            dirty_entries,
            syncs: counters.syncs.load(Ordering::Relaxed),
            failed_syncs: counters.failed_syncs.load(Ordering::Relaxed),
            backup_failures: counters.backup_failures.load(Ordering::Relaxed),
            last_sync: self.shared.last_sync(),
            durable_records,
            durable_last_sync,
        })
    }

    /// Stop the background task, run a final sync and release the cache and
    /// durable resources.
    ///
    /// Resources are released even when the final sync fails; that error is
    /// returned and the unsynced entries stay in the on-disk cache for the
    /// next open. Calling `close` again is a no-op.
    pub async fn close(&self) -> StoreResult<()> {
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(background) = background {
            background.stop().await;
        }

        let _gate = self.shared.sync_gate.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let synced = self.shared.sync_locked(&SyncContext::new()).await;
        self.shared.release().await;

        match synced {
            Ok(report) => {
                tracing::info!(
                    tenant = %self.shared.tenant_id,
                    instance = %self.shared.instance_id,
                    flushed = report.flushed,
                    "Tenant store closed"
                );
                Ok(())
            }
            Err(e) if e.is_closed() => Ok(()),
            Err(e) => {
                tracing::warn!(
                    tenant = %self.shared.tenant_id,
                    error = %e,
                    "Tenant store closed with unsynced entries"
                );
                Err(e)
            }
        }
    }
}

impl Drop for TenantStore {
    fn drop(&mut self) {
        if let Some(background) = self
            .background
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            background.signal();
        }
    }
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("tenant_id", &self.shared.tenant_id)
            .field("instance_id", &self.shared.instance_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
