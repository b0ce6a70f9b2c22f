//! Keeper Core - Record, Identity, Error and Configuration Types
//!
//! Pure data structures shared by the storage engine and its callers.
//! This crate contains no I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod records;

pub use config::{
    BackupTarget, KeeperConfig, DEFAULT_CACHE_MAP_SIZE_MB, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_IDLE_THRESHOLD, DEFAULT_SYNC_INTERVAL,
};
pub use error::{ConfigError, StoreError, StoreResult, TenantFailure};
pub use identity::{RecordId, TenantId, Timestamp};
pub use records::{
    Company, IdKind, Job, JobStatus, MatchResult, Profile, Record, RecordKind,
    RecordKindParseError,
};
