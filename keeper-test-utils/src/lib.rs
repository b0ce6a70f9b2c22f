//! Keeper Test Utilities
//!
//! Centralized test infrastructure for the Keeper workspace:
//! - Proptest generators for tenant ids and records
//! - Test fixtures for common scenarios
//! - Temporary data directories and tracing setup

use std::path::{Path, PathBuf};
use std::sync::Once;

// Re-export core types for convenience
pub use keeper_core::{
    Company, Job, JobStatus, KeeperConfig, MatchResult, Profile, Record, RecordId, RecordKind,
    StoreError, StoreResult, TenantId, Timestamp,
};

// ============================================================================
// TRACING
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn` so test output stays quiet.
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// DATA DIRECTORIES
// ============================================================================

/// A temporary base data directory, removed on drop.
pub struct TestDataDir {
    dir: tempfile::TempDir,
}

impl TestDataDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().expect("TempDir creation should succeed"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory a tenant's files live in.
    pub fn tenant_root(&self, tenant: &TenantId) -> PathBuf {
        self.dir.path().join(tenant.path_segment())
    }

    /// Ephemeral provider config rooted here: no background sync.
    pub fn config(&self) -> KeeperConfig {
        KeeperConfig::ephemeral(self.dir.path())
    }
}

impl Default for TestDataDir {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Keeper types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    /// Generate a tenant id that is used verbatim as a directory name.
    pub fn arb_plain_tenant_id() -> impl Strategy<Value = TenantId> {
        "[a-z][a-z0-9_-]{0,20}"
            .prop_map(|s| TenantId::new(s).expect("generated tenant id should be valid"))
    }

    /// Generate any non-blank tenant id, including ones that must be hashed.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        prop_oneof![
            arb_plain_tenant_id(),
            ".{1,80}"
                .prop_filter("non-blank", |s| !s.trim().is_empty())
                .prop_map(|s| TenantId::new(s).expect("generated tenant id should be valid")),
        ]
    }

    pub fn arb_record_kind() -> impl Strategy<Value = RecordKind> {
        prop::sample::select(RecordKind::ALL.to_vec())
    }

    pub fn arb_job_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Saved),
            Just(JobStatus::Applied),
            Just(JobStatus::Interviewing),
            Just(JobStatus::Offer),
            Just(JobStatus::Rejected),
            Just(JobStatus::Archived),
        ]
    }

    /// Generate a millisecond-precision timestamp in a reasonable range.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..4_102_444_800_000).prop_map(|ms| {
            Utc.timestamp_millis_opt(ms)
                .single()
                .expect("timestamp should be in range")
        })
    }

    /// Generate an unsaved Profile (id 0).
    pub fn arb_profile() -> impl Strategy<Value = Profile> {
        (
            "[A-Z][a-z]{1,12} [A-Z][a-z]{1,12}",
            "[a-z]{1,10}@[a-z]{1,10}\\.com",
            "[a-zA-Z ]{0,60}",
            prop::collection::vec("[a-z+#]{1,12}", 0..6),
            0u32..40,
        )
            .prop_map(|(name, email, headline, skills, experience_years)| Profile {
                id: 0,
                name,
                email,
                headline,
                summary: String::new(),
                skills,
                experience_years,
            })
    }

    /// Generate an unsaved Company (id 0).
    pub fn arb_company() -> impl Strategy<Value = Company> {
        (
            "[A-Z][a-zA-Z]{1,20}",
            prop::option::of("https://[a-z]{1,12}\\.com"),
            prop::option::of("[a-z]{3,12}"),
        )
            .prop_map(|(name, website, industry)| Company {
                id: 0,
                name,
                website,
                industry,
                notes: String::new(),
            })
    }

    /// Generate an unsaved Job (id 0) with no company attached.
    pub fn arb_job() -> impl Strategy<Value = Job> {
        (
            "[A-Z][a-zA-Z ]{1,40}",
            "[a-zA-Z0-9 .,]{0,200}",
            prop::option::of("[A-Z][a-z]{2,15}"),
            arb_job_status(),
        )
            .prop_map(|(title, description, location, status)| Job {
                id: 0,
                company_id: None,
                title,
                description,
                location,
                url: None,
                status,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    pub fn tenant(raw: &str) -> TenantId {
        TenantId::new(raw).expect("fixture tenant id should be valid")
    }

    pub fn profile(name: &str) -> Profile {
        Profile {
            id: 0,
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
            headline: "Backend engineer".to_string(),
            summary: "Builds storage systems.".to_string(),
            skills: vec!["rust".to_string(), "sql".to_string()],
            experience_years: 7,
        }
    }

    pub fn company(name: &str) -> Company {
        Company {
            id: 0,
            name: name.to_string(),
            website: Some(format!("https://{}.example.com", name.to_lowercase())),
            industry: Some("software".to_string()),
            notes: String::new(),
        }
    }

    /// An unsaved job with only a title, as in the basic save/reopen scenario.
    pub fn job(title: &str) -> Job {
        Job {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn job_at(title: &str, company_id: i64) -> Job {
        Job {
            company_id: Some(company_id),
            ..job(title)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_job_is_unsaved() {
        let job = fixtures::job("Engineer");
        assert!(job.record_id().is_unassigned());
        assert_eq!(fixtures::job_at("SRE", 3).company_id, Some(3));
    }

    #[test]
    fn test_data_dir_config_is_ephemeral() {
        let dir = TestDataDir::new();
        let config = dir.config();
        assert_eq!(config.data_dir, dir.path());
        assert!(config.sync_interval.is_none());
        assert_eq!(
            dir.tenant_root(&fixtures::tenant("alice")),
            dir.path().join("alice")
        );
    }

    proptest! {
        #[test]
        fn prop_generated_jobs_are_unsaved(job in generators::arb_job()) {
            prop_assert!(job.record_id().is_unassigned());
            prop_assert!(!job.title.is_empty());
        }

        #[test]
        fn prop_generated_tenants_are_path_safe(tenant in generators::arb_tenant_id()) {
            prop_assert!(!tenant.path_segment().contains('/'));
        }
    }
}
