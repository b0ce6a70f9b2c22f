//! Sync engine: flushes dirty cache entries into the durable layer.
//!
//! A sync snapshots the dirty set under the tenant's operation lock, commits
//! it on a blocking thread in one SQLite transaction without holding that
//! lock, then re-takes the lock to clear markers whose revision did not move
//! in the meantime. Overlapping syncs are serialized by a separate gate.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use keeper_core::{StoreError, StoreResult, TenantId, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::RecordKey;
use crate::durable::{DurableError, DurableStore};
use crate::store::StoreShared;

// ============================================================================
// CONTEXT & REPORT
// ============================================================================

/// Cancellation and deadline for one sync call.
///
/// Checked before snapshotting, between durable row writes and right before
/// commit. A cancelled sync rolls back and leaves every entry dirty.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl SyncContext {
    /// A context that never cancels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel once `true` is sent on the paired sender.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A context plus the sender that cancels it.
    pub fn cancellable() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new().with_cancel(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return true;
            }
        }
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// What happened to the backup step of a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// The store has no backup adapter.
    NotConfigured,
    /// Nothing was flushed, so there was nothing new to back up.
    Skipped,
    Pushed { target: String },
    /// The push failed. The sync itself still succeeded.
    Failed { target: String, reason: String },
}

/// Result of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries written to the durable layer.
    pub flushed: usize,
    /// Dirty markers cleared afterwards. Lower than `flushed` when entries
    /// were rewritten while the batch was committing.
    pub cleared: usize,
    /// Commit time, `None` when there was nothing to flush.
    pub synced_at: Option<Timestamp>,
    pub backup: BackupOutcome,
}

// ============================================================================
// SYNC
// ============================================================================

impl StoreShared {
    /// Run one sync, serialized against every other sync of this tenant.
    pub(crate) async fn sync(&self, ctx: &SyncContext) -> StoreResult<SyncReport> {
        let _gate = self.sync_gate.lock().await;
        self.sync_locked(ctx).await
    }

    /// Sync body. The caller holds `sync_gate`.
    pub(crate) async fn sync_locked(&self, ctx: &SyncContext) -> StoreResult<SyncReport> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let (batch, durable) = {
            let slot = self.resources.lock().await;
            let res = self.open_resources(&slot)?;
            (res.cache.dirty_snapshot()?, Arc::clone(&res.durable))
        };

        if batch.is_empty() {
            tracing::debug!(tenant = %self.tenant_id, "Nothing to sync");
            let backup = if self.backup.is_some() {
                BackupOutcome::Skipped
            } else {
                BackupOutcome::NotConfigured
            };
            return Ok(SyncReport {
                flushed: 0,
                cleared: 0,
                synced_at: None,
                backup,
            });
        }

        let pending = batch.len();
        let flushed: Vec<(RecordKey, u64)> = batch
            .iter()
            .map(|entry| (RecordKey::new(entry.kind, entry.id.clone()), entry.revision))
            .collect();
        let synced_at = Utc::now();

        let writer = Arc::clone(&durable);
        let token = ctx.clone();
        let committed = tokio::task::spawn_blocking(move || {
            writer.commit_batch(&batch, synced_at, || token.is_cancelled())
        })
        .await;

        match committed {
            Ok(Ok(_)) => {}
            Ok(Err(DurableError::Cancelled)) => {
                self.counters.record_failed_sync();
                tracing::info!(tenant = %self.tenant_id, pending, "Sync cancelled, entries stay dirty");
                return Err(StoreError::Cancelled);
            }
            Ok(Err(e)) => {
                self.counters.record_failed_sync();
                tracing::warn!(tenant = %self.tenant_id, pending, error = %e, "Sync failed, entries stay dirty");
                return Err(StoreError::Sync {
                    pending,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                self.counters.record_failed_sync();
                tracing::warn!(tenant = %self.tenant_id, pending, error = %e, "Sync worker failed");
                return Err(StoreError::Sync {
                    pending,
                    reason: e.to_string(),
                });
            }
        }

        let cleared = {
            let slot = self.resources.lock().await;
            let res = self.open_resources(&slot)?;
            res.cache.clear_dirty(&flushed)?
        };

        self.set_last_sync(synced_at);
        self.counters.record_sync();
        tracing::info!(
            tenant = %self.tenant_id,
            flushed = pending,
            cleared,
            "Sync committed"
        );

        let backup = self.push_backup(durable).await;

        Ok(SyncReport {
            flushed: pending,
            cleared,
            synced_at: Some(synced_at),
            backup,
        })
    }

    /// Snapshot the durable file and hand it to the backup adapter.
    ///
    /// Failures are logged and counted, never returned.
    pub(crate) async fn push_backup(&self, durable: Arc<DurableStore>) -> BackupOutcome {
        let Some(sink) = &self.backup else {
            return BackupOutcome::NotConfigured;
        };
        let target = sink.target();

        let dir = self.root.join("snapshots");
        let path = dir.join(format!("snapshot-{}.db", Uuid::now_v7()));

        let result: Result<(), String> = async {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| e.to_string())?;
            let dest = path.clone();
            tokio::task::spawn_blocking(move || durable.snapshot_to(&dest))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;
            sink.push(&self.tenant_id, &path)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(tenant = %self.tenant_id, error = %e, "Failed to remove snapshot");
            }
        }

        match result {
            Ok(()) => {
                tracing::debug!(tenant = %self.tenant_id, target = %target, "Backup pushed");
                BackupOutcome::Pushed { target }
            }
            Err(reason) => {
                self.counters.record_backup_failure();
                tracing::warn!(
                    tenant = %self.tenant_id,
                    target = %target,
                    error = %reason,
                    "Backup failed"
                );
                BackupOutcome::Failed { target, reason }
            }
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Handle to a store's periodic sync task.
pub(crate) struct BackgroundSync {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundSync {
    /// Spawn the task on the current runtime, or `None` outside one.
    pub(crate) fn spawn(shared: &Arc<StoreShared>, every: Duration) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(background_sync_task(
            Arc::downgrade(shared),
            shared.tenant_id.clone(),
            every,
            shutdown_rx,
        ));
        Some(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Ask the task to stop without waiting for it.
    pub(crate) fn signal(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the task and wait until it has exited. An in-flight sync is
    /// cancelled.
    pub(crate) async fn stop(self) {
        self.signal();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Background sync task did not exit cleanly");
        }
    }
}

/// Periodically syncs one store until shutdown is signalled or the store is
/// dropped.
async fn background_sync_task(
    shared: Weak<StoreShared>,
    tenant: TenantId,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    tracing::info!(
        tenant = %tenant,
        interval_secs = every.as_secs(),
        "Background sync task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(store) = shared.upgrade() else {
                    break;
                };
                let ctx = SyncContext::new().with_cancel(shutdown_rx.clone());
                match store.sync(&ctx).await {
                    Ok(report) if report.flushed > 0 => {
                        tracing::debug!(tenant = %tenant, flushed = report.flushed, "Background sync flushed entries");
                    }
                    Ok(_) => {}
                    Err(StoreError::Cancelled) => {}
                    Err(e) if e.is_closed() => break,
                    Err(e) => {
                        tracing::warn!(tenant = %tenant, error = %e, "Background sync failed");
                    }
                }
            }
        }
    }

    tracing::info!(tenant = %tenant, "Background sync task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_default_never_cancels() {
        assert!(!SyncContext::new().is_cancelled());
    }

    #[test]
    fn test_context_cancel_signal() {
        let (tx, ctx) = SyncContext::cancellable();
        assert!(!ctx.is_cancelled());
        tx.send(true).expect("send should succeed");
        assert!(ctx.is_cancelled());
        assert!(ctx.clone().is_cancelled());
    }

    #[test]
    fn test_context_deadline() {
        let expired = SyncContext::new().with_deadline(Instant::now());
        assert!(expired.is_cancelled());
        let later = SyncContext::new().with_timeout(Duration::from_secs(3600));
        assert!(!later.is_cancelled());
    }
}
