//! Registry of open tenant stores.
//!
//! Stores are opened lazily on first access and cached by tenant id. There is
//! at most one live [`TenantStore`] per tenant: lookups take the read lock,
//! creation re-checks under the write lock.
//!
//! Eviction moves a store from `open` to `closing` under the write lock and
//! runs the close (final sync and backup) after releasing it. A tenant that is
//! still closing is not reopened until its old instance has released the
//! cache environment; `get_storage` joins that close first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keeper_core::{KeeperConfig, StoreError, StoreResult, TenantFailure, TenantId};
use tokio::sync::RwLock as TokioRwLock;

use crate::backup::{sink_from_target, BackupSink};
use crate::store::{StoreOptions, TenantStore, TenantStoreHandle};
use crate::sync::SyncContext;

#[derive(Default)]
struct Registry {
    open: HashMap<TenantId, TenantStoreHandle>,
    /// Evicted stores whose close may still be running.
    closing: HashMap<TenantId, TenantStoreHandle>,
}

impl Registry {
    /// Move `tenant` from `open` to `closing`.
    fn retire(&mut self, tenant: &TenantId) -> Option<TenantStoreHandle> {
        let store = self.open.remove(tenant)?;
        self.closing.insert(tenant.clone(), Arc::clone(&store));
        Some(store)
    }
}

/// Lazily opens, caches and reclaims per-tenant stores.
pub struct StoreProvider {
    config: KeeperConfig,
    backup: Option<Arc<dyn BackupSink>>,
    registry: TokioRwLock<Registry>,
}

impl StoreProvider {
    /// Create a provider, building the backup adapter described by the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when the configuration is invalid.
    pub fn new(config: KeeperConfig) -> StoreResult<Self> {
        config.validate()?;
        let backup = sink_from_target(&config.backup)?;
        Ok(Self::build(config, backup))
    }

    /// Create a provider with an explicit backup adapter, which is used when
    /// the configuration enables cloud mode.
    pub fn with_backup(config: KeeperConfig, sink: Arc<dyn BackupSink>) -> StoreResult<Self> {
        // The injected sink stands in for a configured backup target.
        let mut check = config.clone();
        check.cloud_mode = false;
        check.validate()?;
        Ok(Self::build(config, Some(sink)))
    }

    fn build(config: KeeperConfig, backup: Option<Arc<dyn BackupSink>>) -> Self {
        tracing::info!(
            data_dir = %config.data_dir.display(),
            cloud_mode = config.cloud_mode,
            backup = %backup.as_ref().map(|s| s.target()).unwrap_or_default(),
            "Store provider created"
        );
        Self {
            config,
            backup,
            registry: TokioRwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// Return the tenant's store, opening and registering it on first use.
    ///
    /// A registered store that was closed directly is replaced by a fresh
    /// instance.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Config`] for an empty tenant id
    /// - [`StoreError::Open`] when the store cannot be opened; nothing is
    ///   registered and the call can be retried
    pub async fn get_storage(&self, tenant_id: &str) -> StoreResult<TenantStoreHandle> {
        let tenant = TenantId::new(tenant_id)?;

        loop {
            {
                let registry = self.registry.read().await;
                if let Some(store) = registry.open.get(&tenant) {
                    if !store.is_closed() {
                        return Ok(Arc::clone(store));
                    }
                }
            }

            let retiring = {
                let mut registry = self.registry.write().await;
                let registered = registry
                    .open
                    .get(&tenant)
                    .map(|store| (Arc::clone(store), store.is_closed()));
                let closing = registry.closing.get(&tenant).cloned();
                match (registered, closing) {
                    (Some((store, false)), _) => return Ok(store),
                    // Closed directly by a caller.
                    (Some((_, true)), _) => registry.retire(&tenant),
                    (None, Some(old)) => Some(old),
                    (None, None) => {
                        let options = StoreOptions::from_config(
                            tenant.clone(),
                            &self.config,
                            self.backup.clone(),
                        );
                        let store = Arc::new(TenantStore::open_with(options).await?);
                        registry.open.insert(tenant, Arc::clone(&store));
                        return Ok(store);
                    }
                }
            };

            // Join the old instance's close, then look again. Its failure is
            // reported by whoever evicted it.
            if let Some(old) = retiring {
                if let Err(e) = self.finish_close(&tenant, &old).await {
                    tracing::debug!(tenant = %tenant, error = %e, "Previous instance closed with an error");
                }
            }
        }
    }

    /// Close a retired store and drop it from `closing`.
    ///
    /// `close` is idempotent and serialized per store, so concurrent callers
    /// all return once the cache environment is released.
    async fn finish_close(&self, tenant: &TenantId, store: &TenantStoreHandle) -> StoreResult<()> {
        let closed = store.close().await;
        let mut registry = self.registry.write().await;
        if registry
            .closing
            .get(tenant)
            .is_some_and(|current| Arc::ptr_eq(current, store))
        {
            registry.closing.remove(tenant);
        }
        closed
    }

    /// Close retired stores one after another, outside the registry lock.
    async fn close_retired(
        &self,
        retired: Vec<(TenantId, TenantStoreHandle)>,
        what: &str,
    ) -> Vec<TenantFailure> {
        let mut failures = Vec::new();
        for (tenant, store) in retired {
            match self.finish_close(&tenant, &store).await {
                Ok(()) => tracing::info!(tenant = %tenant, "{}", what),
                Err(e) => {
                    tracing::error!(tenant = %tenant, error = %e, "Failed to close tenant store");
                    failures.push(TenantFailure {
                        tenant,
                        error: Box::new(e),
                    });
                }
            }
        }
        failures
    }

    /// Close every registered store and clear the registry.
    ///
    /// All stores are deregistered even when some fail to close; failures
    /// are returned together.
    pub async fn close_all(&self) -> StoreResult<()> {
        let retired: Vec<(TenantId, TenantStoreHandle)> = {
            let mut registry = self.registry.write().await;
            let tenants: Vec<TenantId> = registry.open.keys().cloned().collect();
            tenants
                .into_iter()
                .filter_map(|tenant| registry.retire(&tenant).map(|store| (tenant, store)))
                .collect()
        };
        let failures = self.close_retired(retired, "Closed tenant store").await;
        StoreError::aggregate(failures)
    }

    /// Close and deregister every store whose last sync is older than
    /// `now - idle_threshold`, plus any store already closed by its caller.
    /// Returns the evicted tenants.
    ///
    /// A store that fails to close is still deregistered and reported in the
    /// aggregated error.
    pub async fn cleanup_inactive(&self, idle_threshold: Duration) -> StoreResult<Vec<TenantId>> {
        let cutoff = chrono::Duration::from_std(idle_threshold)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let retired: Vec<(TenantId, TenantStoreHandle)> = {
            let mut registry = self.registry.write().await;
            let idle_tenants: Vec<TenantId> = registry
                .open
                .iter()
                .filter(|(_, store)| store.is_closed() || store.last_sync_time() < cutoff)
                .map(|(tenant, _)| tenant.clone())
                .collect();
            idle_tenants
                .into_iter()
                .filter_map(|tenant| registry.retire(&tenant).map(|store| (tenant, store)))
                .collect()
        };

        let mut evicted: Vec<TenantId> = retired.iter().map(|(tenant, _)| tenant.clone()).collect();
        let failures = self
            .close_retired(retired, "Evicted inactive tenant store")
            .await;
        StoreError::aggregate(failures)?;
        evicted.sort();
        Ok(evicted)
    }

    /// Tenants with a registered store, sorted.
    pub async fn active_users(&self) -> Vec<TenantId> {
        let registry = self.registry.read().await;
        let mut tenants: Vec<TenantId> = registry
            .open
            .iter()
            .filter(|(_, store)| !store.is_closed())
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        tenants
    }

    /// Sync every registered store. Returns the number of entries flushed.
    pub async fn sync_all(&self, ctx: &SyncContext) -> StoreResult<usize> {
        let snapshot: Vec<(TenantId, TenantStoreHandle)> = {
            let registry = self.registry.read().await;
            registry
                .open
                .iter()
                .map(|(tenant, store)| (tenant.clone(), Arc::clone(store)))
                .collect()
        };

        let mut flushed = 0;
        let mut failures = Vec::new();
        for (tenant, store) in snapshot {
            match store.sync(ctx).await {
                Ok(report) => flushed += report.flushed,
                Err(e) if e.is_closed() => {}
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %e, "Sync failed");
                    failures.push(TenantFailure {
                        tenant,
                        error: Box::new(e),
                    });
                }
            }
        }
        StoreError::aggregate(failures)?;
        Ok(flushed)
    }
}

impl std::fmt::Debug for StoreProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreProvider")
            .field("config", &self.config)
            .field("backup", &self.backup.as_ref().map(|s| s.target()))
            .finish()
    }
}
