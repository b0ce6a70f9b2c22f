//! Identity types for tenants and records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::ConfigError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Longest tenant id that is used verbatim as a directory name.
const MAX_VERBATIM_SEGMENT: usize = 64;

/// Opaque identifier of a tenant.
///
/// Every per-tenant resource (cache environment, durable file, backup
/// target) is partitioned by this value. It can only be constructed through
/// [`TenantId::new`], which rejects empty identifiers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, failing fast on an empty or blank value.
    pub fn new(raw: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "tenant_id".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory segment for this tenant.
    ///
    /// Plain identifiers (`[A-Za-z0-9_-]`, at most 64 chars) are used as-is.
    /// Anything else, including ids that are themselves shaped like a digest
    /// segment, is replaced by `t-` followed by 32 hex chars of its SHA-256
    /// digest.
    pub fn path_segment(&self) -> String {
        if is_plain_segment(&self.0) {
            return self.0.clone();
        }
        let digest = Sha256::digest(self.0.as_bytes());
        format!("t-{}", &hex::encode(digest)[..32])
    }
}

fn is_plain_segment(raw: &str) -> bool {
    raw.len() <= MAX_VERBATIM_SEGMENT
        && raw != "."
        && raw != ".."
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        && !looks_like_digest_segment(raw)
}

fn looks_like_digest_segment(raw: &str) -> bool {
    raw.len() == 34
        && raw.starts_with("t-")
        && raw[2..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TenantId {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Identifier of a record within its kind.
///
/// Integer ids use `0` to mean "not yet assigned"; the store allocates one on
/// save. String keys must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Key(String),
}

impl RecordId {
    /// Whether this id still needs to be allocated by the store.
    pub fn is_unassigned(&self) -> bool {
        matches!(self, RecordId::Int(0))
    }

    /// The integer value, if this is an integer id.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordId::Int(id) => Some(*id),
            RecordId::Key(_) => None,
        }
    }

    /// The string key, if this is a keyed id.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            RecordId::Int(_) => None,
            RecordId::Key(key) => Some(key),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Key(key) => f.write_str(key),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId::Int(value)
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        RecordId::Key(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        RecordId::Key(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_rejects_empty() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert!(TenantId::new("alice").is_ok());
    }

    #[test]
    fn test_plain_tenant_id_used_verbatim() {
        let tenant = TenantId::new("user_42-prod").expect("tenant id should be valid");
        assert_eq!(tenant.path_segment(), "user_42-prod");
    }

    #[test]
    fn test_unsafe_tenant_id_is_hashed() {
        for raw in ["../etc", "a/b", "..", "alice@example.com", "Ünïcode"] {
            let tenant = TenantId::new(raw).expect("tenant id should be valid");
            let segment = tenant.path_segment();
            assert!(segment.starts_with("t-"), "{} -> {}", raw, segment);
            assert_eq!(segment.len(), 34);
            assert!(!segment.contains('/'));
        }
    }

    #[test]
    fn test_digest_shaped_tenant_id_is_hashed() {
        let hashed = TenantId::new("a/b").expect("tenant id should be valid");
        let segment = hashed.path_segment();
        let lookalike = TenantId::new(segment.clone()).expect("tenant id should be valid");
        assert_ne!(lookalike.path_segment(), segment);
    }

    #[test]
    fn test_tenant_id_serde_rejects_empty() {
        let parsed: Result<TenantId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
        let parsed: TenantId = serde_json::from_str("\"bob\"").expect("parse should succeed");
        assert_eq!(parsed.as_str(), "bob");
    }

    #[test]
    fn test_record_id_helpers() {
        assert!(RecordId::Int(0).is_unassigned());
        assert!(!RecordId::Int(7).is_unassigned());
        assert!(!RecordId::from("k").is_unassigned());
        assert_eq!(RecordId::from(9).as_int(), Some(9));
        assert_eq!(RecordId::from("k").as_key(), Some("k"));
        assert_eq!(RecordId::from("job-1").to_string(), "job-1");
    }
}
