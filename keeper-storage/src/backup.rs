//! Remote backup adapters.
//!
//! After a sync commits, the store writes a consistent snapshot of the
//! tenant's durable file and hands its path to a [`BackupSink`]. Sinks are
//! shared across tenants; every push carries the tenant it belongs to.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keeper_core::{BackupTarget, StoreError, TenantId};
use thiserror::Error;

/// File name of a tenant's snapshot at the backup target.
pub const SNAPSHOT_FILE_NAME: &str = "store.db";

/// Backup transport errors. Never fatal to a sync.
#[derive(Debug, Clone, Error)]
pub enum BackupError {
    #[error("backup io error: {0}")]
    Io(String),

    #[error("backup transport error: {0}")]
    Transport(String),

    #[error("backup target rejected snapshot with status {status}")]
    Rejected { status: u16 },

    #[error("backup injected failure: {0}")]
    Injected(String),
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(e: reqwest::Error) -> Self {
        BackupError::Transport(e.to_string())
    }
}

/// Destination for tenant snapshots.
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Human-readable description of the target, used in logs and reports.
    fn target(&self) -> String;

    /// Upload the snapshot at `snapshot` for `tenant`.
    async fn push(&self, tenant: &TenantId, snapshot: &Path) -> Result<(), BackupError>;
}

/// Build the sink described by `target`, or `None` for [`BackupTarget::None`].
pub fn sink_from_target(target: &BackupTarget) -> Result<Option<Arc<dyn BackupSink>>, StoreError> {
    let sink: Arc<dyn BackupSink> = match target {
        BackupTarget::None => return Ok(None),
        BackupTarget::Directory(root) => Arc::new(DirectoryBackup::new(root.clone())),
        BackupTarget::Http { endpoint, token } => {
            Arc::new(HttpBackup::new(endpoint.clone(), token.clone())?)
        }
    };
    Ok(Some(sink))
}

// ============================================================================
// DIRECTORY
// ============================================================================

/// Copies snapshots to `<root>/<tenant-segment>/store.db`.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    root: PathBuf,
}

impl DirectoryBackup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the snapshot of `tenant` ends up.
    pub fn destination(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.path_segment()).join(SNAPSHOT_FILE_NAME)
    }
}

#[async_trait]
impl BackupSink for DirectoryBackup {
    fn target(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn push(&self, tenant: &TenantId, snapshot: &Path) -> Result<(), BackupError> {
        let dest = self.destination(tenant);
        let dir = dest
            .parent()
            .ok_or_else(|| BackupError::Io(format!("no parent for {}", dest.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        // Copy beside the destination, then rename over it.
        let staging = dir.join(format!("{}.partial", SNAPSHOT_FILE_NAME));
        tokio::fs::copy(snapshot, &staging).await?;
        tokio::fs::rename(&staging, &dest).await?;
        Ok(())
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Uploads snapshots with `PUT <endpoint>/<tenant-segment>/store.db`.
pub struct HttpBackup {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpBackup {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().build().map_err(|e| StoreError::Backup {
            target: "http".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn url_for(&self, tenant: &TenantId) -> String {
        format!("{}/{}/{}", self.endpoint, tenant.path_segment(), SNAPSHOT_FILE_NAME)
    }
}

impl std::fmt::Debug for HttpBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackup")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl BackupSink for HttpBackup {
    fn target(&self) -> String {
        self.endpoint.clone()
    }

    async fn push(&self, tenant: &TenantId, snapshot: &Path) -> Result<(), BackupError> {
        let body = tokio::fs::read(snapshot).await?;
        let mut request = self
            .client
            .put(self.url_for(tenant))
            .header(reqwest::header::CONTENT_TYPE, "application/vnd.sqlite3")
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackupError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A snapshot received by [`MemoryBackup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    pub tenant: TenantId,
    pub size_bytes: u64,
}

/// In-process sink that records pushes. Can be switched to fail.
#[derive(Debug, Default)]
pub struct MemoryBackup {
    pushes: Mutex<Vec<RecordedPush>>,
    failing: AtomicBool,
}

impl MemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following push fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<RecordedPush> {
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl BackupSink for MemoryBackup {
    fn target(&self) -> String {
        "memory".to_string()
    }

    async fn push(&self, tenant: &TenantId, snapshot: &Path) -> Result<(), BackupError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackupError::Injected(format!("push for {} refused", tenant)));
        }
        let size_bytes = tokio::fs::metadata(snapshot).await?.len();
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedPush {
                tenant: tenant.clone(),
                size_bytes,
            });
        Ok(())
    }
}
