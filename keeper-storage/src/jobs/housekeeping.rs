//! Periodic eviction of idle tenant stores.
//!
//! Calls [`StoreProvider::cleanup_inactive`] on a fixed cadence until the
//! shutdown signal fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keeper_core::{KeeperConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_THRESHOLD};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::provider::StoreProvider;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the housekeeping job.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// How often to look for idle stores.
    pub check_interval: Duration,

    /// Stores whose last sync is older than this are evicted.
    pub idle_threshold: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CLEANUP_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

impl HousekeepingConfig {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            check_interval: config.cleanup_interval,
            idle_threshold: config.idle_threshold,
        }
    }

    /// Short cadence for development and tests.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            idle_threshold: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for housekeeping activity.
#[derive(Debug, Default)]
pub struct HousekeepingMetrics {
    /// Completed cleanup cycles
    pub cycles: AtomicU64,

    /// Tenant stores evicted since startup
    pub evicted: AtomicU64,

    /// Cycles that reported an error
    pub errors: AtomicU64,
}

impl HousekeepingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HousekeepingSnapshot {
        HousekeepingSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of housekeeping metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HousekeepingSnapshot {
    pub cycles: u64,
    pub evicted: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Evict idle stores every `check_interval` until `shutdown_rx` reads `true`
/// or its sender is dropped.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn housekeeping_task(
    provider: Arc<StoreProvider>,
    config: HousekeepingConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<HousekeepingMetrics> {
    let metrics = Arc::new(HousekeepingMetrics::new());

    let mut cleanup_interval = interval(config.check_interval);
    cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        idle_threshold_secs = config.idle_threshold.as_secs(),
        "Housekeeping task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Housekeeping task shutting down");
                    break;
                }
            }

            _ = cleanup_interval.tick() => {
                run_cycle(&provider, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        evicted = snapshot.evicted,
        errors = snapshot.errors,
        "Housekeeping task completed"
    );

    metrics
}

async fn run_cycle(
    provider: &StoreProvider,
    config: &HousekeepingConfig,
    metrics: &HousekeepingMetrics,
) {
    match provider.cleanup_inactive(config.idle_threshold).await {
        Ok(evicted) => {
            if !evicted.is_empty() {
                tracing::info!(count = evicted.len(), "Evicted idle tenant stores");
            }
            metrics
                .evicted
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Housekeeping cycle failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
    metrics.cycles.fetch_add(1, Ordering::Relaxed);
}
