//! Keeper Storage
//!
//! Per-tenant persistence: an on-disk LMDB cache in front of a SQLite store
//! of record, with explicit and periodic synchronization between the two.
//!
//! - [`TenantStore`]: typed get/save, sync and close for one tenant
//! - [`StoreProvider`]: lazily opens, caches and reclaims tenant stores
//! - [`BackupSink`]: optional remote copy of each tenant's durable file
//!
//! Layout on disk, per tenant:
//!
//! ```text
//! <data_dir>/<tenant segment>/store.db    SQLite (WAL)
//! <data_dir>/<tenant segment>/cache/      LMDB environment
//! <data_dir>/<tenant segment>/snapshots/  transient backup snapshots
//! ```

pub mod backup;
pub mod cache;
pub mod durable;
pub mod jobs;
pub mod provider;
pub mod store;
pub mod sync;

pub use backup::{
    sink_from_target, BackupError, BackupSink, DirectoryBackup, HttpBackup, MemoryBackup,
    RecordedPush,
};
pub use cache::{CacheEntry, CacheError, RecordKey, TenantCache};
pub use durable::{DurableError, DurableRecord, DurableStore};
pub use jobs::{housekeeping_task, HousekeepingConfig, HousekeepingMetrics};
pub use provider::StoreProvider;
pub use store::{StoreOptions, StoreStats, TenantStore, TenantStoreHandle};
pub use sync::{BackupOutcome, SyncContext, SyncReport};
