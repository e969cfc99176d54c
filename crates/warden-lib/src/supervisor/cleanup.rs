//! Disk protection actions
//!
//! A fixed sequence of cleanup steps run when disk usage crosses the
//! protection threshold: journal vacuum, stale temp file removal, old
//! compressed log removal. Each step's outcome is logged and a failure
//! never stops the remaining steps.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for the cleanup sequence.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Directory scanned for stale temp files
    pub tmp_dir: PathBuf,
    /// Directory scanned for old compressed logs
    pub log_dir: PathBuf,
    /// Temp files older than this are removed
    pub tmp_max_age: Duration,
    /// Compressed logs older than this are removed
    pub archive_max_age: Duration,
    /// Retention argument handed to the journal vacuum
    pub journal_keep: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("/tmp"),
            log_dir: PathBuf::from("/var/log"),
            tmp_max_age: Duration::from_secs(48 * 3_600),
            archive_max_age: Duration::from_secs(7 * 24 * 3_600),
            journal_keep: "3d".to_string(),
        }
    }
}

/// Outcome of one cleanup action.
#[derive(Debug, Clone)]
pub struct CleanupOutcome {
    pub action: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Run the full cleanup sequence, continuing past individual failures.
pub async fn run_disk_cleanup(config: &CleanupConfig) -> Vec<CleanupOutcome> {
    let mut outcomes = Vec::with_capacity(3);

    outcomes.push(vacuum_journal(&config.journal_keep).await);
    outcomes.push(
        remove_stale_files(
            "remove_stale_temp_files",
            &config.tmp_dir,
            config.tmp_max_age,
            None,
        )
        .await,
    );
    outcomes.push(
        remove_stale_files(
            "remove_old_compressed_logs",
            &config.log_dir,
            config.archive_max_age,
            Some("gz"),
        )
        .await,
    );

    for outcome in &outcomes {
        if outcome.ok {
            info!(action = outcome.action, detail = %outcome.detail, "Cleanup action completed");
        } else {
            warn!(action = outcome.action, detail = %outcome.detail, "Cleanup action failed");
        }
    }
    outcomes
}

async fn vacuum_journal(keep: &str) -> CleanupOutcome {
    let action = "journal_vacuum";
    let arg = format!("--vacuum-time={keep}");
    let fut = Command::new("journalctl").arg(&arg).output();
    match timeout(COMMAND_TIMEOUT, fut).await {
        Ok(Ok(output)) if output.status.success() => CleanupOutcome {
            action,
            ok: true,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Ok(Ok(output)) => CleanupOutcome {
            action,
            ok: false,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Ok(Err(e)) => CleanupOutcome {
            action,
            ok: false,
            detail: e.to_string(),
        },
        Err(_) => CleanupOutcome {
            action,
            ok: false,
            detail: "timed out".to_string(),
        },
    }
}

/// Remove files in `dir` older than `max_age`, optionally filtered by
/// extension. Subdirectories are left alone.
async fn remove_stale_files(
    action: &'static str,
    dir: &Path,
    max_age: Duration,
    extension: Option<&str>,
) -> CleanupOutcome {
    let mut removed = 0usize;
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            return CleanupOutcome {
                action,
                ok: false,
                detail: format!("{}: {e}", dir.display()),
            }
        }
    };

    loop {
        let entry = match read_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return CleanupOutcome {
                    action,
                    ok: false,
                    detail: format!("{}: {e}", dir.display()),
                }
            }
        };
        let path = entry.path();
        if let Some(ext) = extension {
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let old_enough = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age >= max_age)
            .unwrap_or(false);
        if old_enough && tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }

    CleanupOutcome {
        action,
        ok: true,
        detail: format!("removed {removed} from {}", dir.display()),
    }
}
