//! Record kinds and the typed records stored per tenant.
//!
//! The store is agnostic to record content. It only needs the closed set of
//! [`RecordKind`] tags, an identifier and a serde representation, which the
//! [`Record`] trait provides.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::identity::{RecordId, Timestamp};

// ============================================================================
// RECORD KINDS
// ============================================================================

/// Shape of the identifier used by a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Integer ids allocated by the store when saved as `0`.
    Int,
    /// Caller-provided string keys.
    Key,
}

/// Closed set of record kinds a tenant store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Profile,
    Company,
    Job,
    MatchResult,
}

impl RecordKind {
    /// Every kind, in durable-table creation order.
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Profile,
        RecordKind::Company,
        RecordKind::Job,
        RecordKind::MatchResult,
    ];

    /// Stable string form used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Profile => "profile",
            RecordKind::Company => "company",
            RecordKind::Job => "job",
            RecordKind::MatchResult => "match_result",
        }
    }

    /// Single-byte tag used in cache keys. Never reorder.
    pub fn tag(&self) -> u8 {
        match self {
            RecordKind::Profile => 1,
            RecordKind::Company => 2,
            RecordKind::Job => 3,
            RecordKind::MatchResult => 4,
        }
    }

    /// Inverse of [`RecordKind::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Profile),
            2 => Some(RecordKind::Company),
            3 => Some(RecordKind::Job),
            4 => Some(RecordKind::MatchResult),
            _ => None,
        }
    }

    pub fn id_kind(&self) -> IdKind {
        match self {
            RecordKind::MatchResult => IdKind::Key,
            _ => IdKind::Int,
        }
    }

    /// Payload field holding a reference to another kind's integer id, if any.
    ///
    /// The durable layer mirrors this field into a foreign-key column.
    pub fn reference(&self) -> Option<(&'static str, RecordKind)> {
        match self {
            RecordKind::Job => Some(("company_id", RecordKind::Company)),
            RecordKind::MatchResult => Some(("job_id", RecordKind::Job)),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = RecordKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "profile" => Ok(RecordKind::Profile),
            "company" => Ok(RecordKind::Company),
            "job" => Ok(RecordKind::Job),
            "matchresult" => Ok(RecordKind::MatchResult),
            _ => Err(RecordKindParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid record kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKindParseError(pub String);

impl fmt::Display for RecordKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid record kind: {}", self.0)
    }
}

impl std::error::Error for RecordKindParseError {}

// ============================================================================
// RECORD TRAIT
// ============================================================================

/// A typed entity that can be saved to and loaded from a tenant store.
///
/// Implementations must report a consistent [`Record::KIND`] and an id whose
/// shape matches [`RecordKind::id_kind`].
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Identifier of this instance.
    fn record_id(&self) -> RecordId;

    /// Write back an id allocated by the store. Only called for integer kinds.
    fn assign_id(&mut self, _id: i64) {}
}

// ============================================================================
// DOMAIN RECORDS
// ============================================================================

/// The tenant's own candidate profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub experience_years: u32,
}

/// A company the tenant tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub notes: String,
}

/// Pipeline status of a job posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Saved,
    Applied,
    Interviewing,
    Offer,
    Rejected,
    Archived,
}

/// A job posting, optionally attached to a [`Company`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub company_id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
}

/// Result of matching a profile against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub key: String,
    pub job_id: i64,
    pub profile_id: i64,
    pub score: f32,
    #[serde(default)]
    pub summary: String,
    pub created_at: Timestamp,
}

impl MatchResult {
    /// Build a match result keyed by its job and profile.
    pub fn new(job_id: i64, profile_id: i64, score: f32, summary: impl Into<String>) -> Self {
        Self {
            key: Self::key_for(job_id, profile_id),
            job_id,
            profile_id,
            score,
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    /// Canonical key for a job/profile pair.
    pub fn key_for(job_id: i64, profile_id: i64) -> String {
        format!("job-{}:profile-{}", job_id, profile_id)
    }
}

impl Record for Profile {
    const KIND: RecordKind = RecordKind::Profile;

    fn record_id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn assign_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Record for Company {
    const KIND: RecordKind = RecordKind::Company;

    fn record_id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn assign_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Record for Job {
    const KIND: RecordKind = RecordKind::Job;

    fn record_id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn assign_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Record for MatchResult {
    const KIND: RecordKind = RecordKind::MatchResult;

    fn record_id(&self) -> RecordId {
        RecordId::Key(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(RecordKind::from_tag(0), None);
        assert_eq!(RecordKind::from_tag(0xFF), None);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("match_result".parse::<RecordKind>(), Ok(RecordKind::MatchResult));
        assert_eq!("MatchResult".parse::<RecordKind>(), Ok(RecordKind::MatchResult));
        assert_eq!("Job".parse::<RecordKind>(), Ok(RecordKind::Job));
        assert!("invoice".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_id_kinds() {
        assert_eq!(Job::KIND.id_kind(), IdKind::Int);
        assert_eq!(MatchResult::KIND.id_kind(), IdKind::Key);
    }

    #[test]
    fn test_assign_id_writes_back() {
        let mut job = Job {
            title: "Engineer".to_string(),
            ..Default::default()
        };
        assert!(job.record_id().is_unassigned());
        job.assign_id(1);
        assert_eq!(job.record_id(), RecordId::Int(1));
    }

    #[test]
    fn test_match_result_key() {
        let result = MatchResult::new(3, 1, 0.82, "strong overlap");
        assert_eq!(result.record_id(), RecordId::Key("job-3:profile-1".to_string()));
    }

    #[test]
    fn test_job_deserializes_with_defaults() {
        let job: Job = serde_json::from_str(r#"{"id":4,"title":"SRE"}"#)
            .expect("job should deserialize");
        assert_eq!(job.status, JobStatus::Saved);
        assert_eq!(job.company_id, None);
    }
}
