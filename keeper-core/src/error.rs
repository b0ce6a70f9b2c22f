//! Error types for Keeper operations

use std::fmt;
use thiserror::Error;

use crate::identity::{RecordId, TenantId};
use crate::records::RecordKind;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// A single tenant's failure inside an aggregated operation.
#[derive(Debug, Clone)]
pub struct TenantFailure {
    pub tenant: TenantId,
    pub error: Box<StoreError>,
}

impl fmt::Display for TenantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tenant, self.error)
    }
}

fn join_failures(failures: &[TenantFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Master error type for all Keeper errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record not found: {kind} with id {id}")]
    NotFound { kind: RecordKind, id: RecordId },

    #[error("Invalid {kind} record: {reason}")]
    InvalidRecord { kind: RecordKind, reason: String },

    #[error("Serialization failed for {kind}: {reason}")]
    Serialization { kind: RecordKind, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Durable store error: {0}")]
    Durable(String),

    #[error("Failed to open store for tenant {tenant}: {reason}")]
    Open { tenant: TenantId, reason: String },

    #[error("Sync failed, {pending} entries left dirty: {reason}")]
    Sync { pending: usize, reason: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Store for tenant {tenant} is closed")]
    Closed { tenant: TenantId },

    #[error("Backup to {target} failed: {reason}")]
    Backup { target: String, reason: String },

    #[error("{} tenant operation(s) failed: {}", .0.len(), join_failures(.0))]
    Aggregate(Vec<TenantFailure>),
}

impl StoreError {
    /// Whether this is the expected "record absent" outcome of a read.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed { .. })
    }

    /// Fold per-tenant failures into one error, or `Ok` when there are none.
    pub fn aggregate(failures: Vec<TenantFailure>) -> StoreResult<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Aggregate(failures))
        }
    }
}

/// Result type alias for Keeper operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================
