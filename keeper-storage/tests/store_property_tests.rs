//! Property-Based Tests for Tenant Store Durability
//!
//! For any sequence of saved records, a sync followed by close commits every
//! record, and a store reopened without its cache reads back the same values
//! from the durable layer.

use keeper_core::{Job, Profile};
use keeper_storage::{StoreOptions, SyncContext, TenantStore};
use keeper_test_utils::{fixtures, generators, TestDataDir};
use proptest::prelude::*;
use tokio::runtime::Runtime;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn fail<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> TestCaseError + '_ {
    move |e| TestCaseError::fail(format!("{}: {}", context, e))
}

async fn open(dir: &TestDataDir) -> Result<TenantStore, TestCaseError> {
    TenantStore::open_with(StoreOptions::ephemeral(fixtures::tenant("prop"), dir.path()))
        .await
        .map_err(fail("open"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: ids are allocated 1..=n in save order and every record
    /// survives sync, close and loss of the cache.
    #[test]
    fn prop_saved_jobs_survive_reopen(jobs in prop::collection::vec(generators::arb_job(), 1..12)) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let dir = TestDataDir::new();
            let store = open(&dir).await?;

            let mut saved: Vec<Job> = Vec::with_capacity(jobs.len());
            for (index, mut job) in jobs.into_iter().enumerate() {
                let id = store.save_job(&mut job).await.map_err(fail("save"))?;
                prop_assert_eq!(id, index as i64 + 1);
                saved.push(job);
            }

            let report = store.sync(&SyncContext::new()).await.map_err(fail("sync"))?;
            prop_assert_eq!(report.flushed, saved.len());
            store.close().await.map_err(fail("close"))?;

            std::fs::remove_dir_all(dir.tenant_root(&fixtures::tenant("prop")).join("cache"))
                .map_err(fail("remove cache"))?;

            let reopened = open(&dir).await?;
            for job in &saved {
                let loaded = reopened.get_job(job.id).await.map_err(fail("get"))?;
                prop_assert_eq!(&loaded, job);
            }
            reopened.close().await.map_err(fail("close"))?;
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: the last write to an id wins, both in the cache and after a
    /// sync round trip.
    #[test]
    fn prop_last_write_wins(versions in prop::collection::vec(generators::arb_profile(), 1..6)) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let dir = TestDataDir::new();
            let store = open(&dir).await?;

            let mut last: Option<Profile> = None;
            for mut profile in versions {
                profile.id = 5;
                store.save_profile(&mut profile).await.map_err(fail("save"))?;
                last = Some(profile);
            }
            let last = last.ok_or_else(|| TestCaseError::fail("no versions generated"))?;

            prop_assert_eq!(&store.get_profile(5).await.map_err(fail("get"))?, &last);
            store.close().await.map_err(fail("close"))?;

            let reopened = open(&dir).await?;
            prop_assert_eq!(&reopened.get_profile(5).await.map_err(fail("get"))?, &last);
            prop_assert_eq!(reopened.dirty_count().await.map_err(fail("count"))?, 0);
            reopened.close().await.map_err(fail("close"))?;
            Ok::<(), TestCaseError>(())
        })?;
    }
}
