//! Durable snapshots
//!
//! Two small JSON snapshots survive restarts: the ban map (overwritten on
//! every ban event) and the periodic health report. Both are written
//! atomically via a temp file rename, and every failure is logged and
//! swallowed: in-memory state is authoritative at runtime and banning must
//! never fail because storage is unavailable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::HealthReport;

/// One persisted ban entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBan {
    /// Ban expiry, unix seconds
    pub ban_until: i64,
    /// Offenses accumulated so far, for ladder escalation after reload
    pub offense_count: u32,
}

/// Full ban state keyed by IP address.
pub type BanSnapshot = HashMap<String, PersistedBan>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// File-backed store for the ban snapshot.
pub struct BanStore {
    path: PathBuf,
}

impl BanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the snapshot, dropping entries that expired while the process
    /// was down. A missing or unreadable file yields an empty map.
    pub async fn load(&self) -> BanSnapshot {
        match self.load_inner().await {
            Ok(mut snapshot) => {
                let now = Utc::now().timestamp();
                let before = snapshot.len();
                snapshot.retain(|_, entry| entry.ban_until > now);
                let dropped = before - snapshot.len();
                if dropped > 0 {
                    debug!(dropped, "Dropped expired bans at load");
                }
                snapshot
            }
            Err(SnapshotError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                BanSnapshot::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to load ban snapshot, starting fresh");
                BanSnapshot::new()
            }
        }
    }

    async fn load_inner(&self) -> Result<BanSnapshot, SnapshotError> {
        let data = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Overwrite the snapshot. Errors are logged, never raised.
    pub async fn save(&self, snapshot: &BanSnapshot) {
        if let Err(e) = write_atomic(&self.path, snapshot).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write ban snapshot");
        }
    }
}

/// Drains ban snapshots off the engine's channel and writes each to disk.
/// Coalesces a backlog down to the most recent snapshot before writing.
pub async fn run_snapshot_writer(store: BanStore, mut rx: mpsc::UnboundedReceiver<BanSnapshot>) {
    info!(path = %store.path.display(), "Starting ban snapshot writer");
    while let Some(mut snapshot) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }
        store.save(&snapshot).await;
    }
    info!("Ban snapshot channel closed, writer exiting");
}

/// File-backed writer for the periodic health report.
pub struct ReportWriter {
    path: PathBuf,
}

impl ReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Overwrite the report. Errors are logged, never raised.
    pub async fn save(&self, report: &HealthReport) {
        if let Err(e) = write_atomic(&self.path, report).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write health report");
        }
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let data = serde_json::to_vec_pretty(value)?;
    let temp = path.with_extension("tmp");
    tokio::fs::write(&temp, &data).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}
