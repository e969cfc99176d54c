//! Cached host resource sampling
//!
//! A background task refreshes CPU, memory, disk and connection-count
//! readings on a fixed cadence; every consumer reads the cached snapshot
//! without touching a syscall. This keeps the sampler safe to call from the
//! request-admission path.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::ResourceSampler;
use crate::models::ResourceSnapshot;

/// Default refresh cadence.
const DEFAULT_REFRESH: Duration = Duration::from_secs(2);

/// Background-refreshed implementation of [`ResourceSampler`].
pub struct CachedSampler {
    snapshot: RwLock<ResourceSnapshot>,
    sys: Mutex<System>,
    disks: Mutex<Disks>,
}

impl CachedSampler {
    /// Create a sampler primed with an initial reading. The first CPU value
    /// is 0.0 until two refreshes have happened; the refresh loop corrects
    /// it within one interval.
    pub fn new() -> Self {
        let sampler = Self {
            snapshot: RwLock::new(ResourceSnapshot::default()),
            sys: Mutex::new(System::new()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        };
        sampler.refresh(0);
        sampler
    }

    /// Take fresh readings and publish them to the cached snapshot.
    fn refresh(&self, open_connections: usize) {
        let (cpu, mem_percent, mem_used_mb) = {
            let mut sys = self.sys.lock().unwrap();
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let cpu = sys.global_cpu_info().cpu_usage() as f64;
            let total = sys.total_memory() as f64;
            let used = sys.used_memory() as f64;
            let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
            (cpu, percent, used / (1024.0 * 1024.0))
        };

        let disk = {
            let mut disks = self.disks.lock().unwrap();
            disks.refresh();
            root_disk_percent(&disks)
        };

        let mut snap = self.snapshot.write().unwrap();
        *snap = ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: mem_percent,
            disk_percent: disk,
            memory_used_mb: mem_used_mb,
            open_connections,
        };
    }

    /// Current cached snapshot.
    pub fn snapshot(&self) -> ResourceSnapshot {
        *self.snapshot.read().unwrap()
    }

    /// Refresh loop. Runs until shutdown; a failed connection count falls
    /// back to the previous value rather than skipping the cycle.
    pub async fn run(
        self: std::sync::Arc<Self>,
        refresh_every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let period = if refresh_every.is_zero() {
            DEFAULT_REFRESH
        } else {
            refresh_every
        };
        info!(interval_secs = period.as_secs(), "Starting resource sampler");

        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let conns = match count_open_connections().await {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "Connection count unavailable");
                            self.snapshot().open_connections
                        }
                    };
                    self.refresh(conns);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down resource sampler");
                    break;
                }
            }
        }
    }
}

impl Default for CachedSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for CachedSampler {
    fn cpu_percent(&self) -> f64 {
        self.snapshot.read().unwrap().cpu_percent
    }

    fn memory_percent(&self) -> f64 {
        self.snapshot.read().unwrap().memory_percent
    }

    fn disk_percent(&self) -> f64 {
        self.snapshot.read().unwrap().disk_percent
    }

    fn memory_used_mb(&self) -> f64 {
        self.snapshot.read().unwrap().memory_used_mb
    }

    fn open_connections(&self) -> usize {
        self.snapshot.read().unwrap().open_connections
    }
}

/// Utilization of the root filesystem, falling back to the fullest disk
/// when no mount is exactly `/`.
fn root_disk_percent(disks: &Disks) -> f64 {
    let mut best = 0.0f64;
    for disk in disks.list() {
        let total = disk.total_space() as f64;
        if total <= 0.0 {
            continue;
        }
        let used = total - disk.available_space() as f64;
        let percent = used / total * 100.0;
        if disk.mount_point() == std::path::Path::new("/") {
            return percent;
        }
        if percent > best {
            best = percent;
        }
    }
    best
}

/// Count established sockets from the procfs TCP tables.
async fn count_open_connections() -> std::io::Result<usize> {
    let mut total = 0;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match tokio::fs::read_to_string(table).await {
            Ok(contents) => total += count_tcp_entries(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(table, "TCP table not available");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Number of socket rows in a procfs TCP table (header line excluded).
fn count_tcp_entries(contents: &str) -> usize {
    contents.lines().skip(1).filter(|l| !l.trim().is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tcp_entries() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue\n\
                     0: 0100007F:1F90 00000000:0000 0A 00000000:00000000\n\
                     1: 0100007F:0050 0100007F:9C40 01 00000000:00000000\n";
        assert_eq!(count_tcp_entries(table), 2);
    }

    #[test]
    fn test_count_tcp_entries_header_only() {
        assert_eq!(count_tcp_entries("  sl  local_address\n"), 0);
    }

    #[test]
    fn test_sampler_snapshot_in_range() {
        let sampler = CachedSampler::new();
        let snap = sampler.snapshot();
        assert!((0.0..=100.0).contains(&snap.memory_percent));
        assert!((0.0..=100.0).contains(&snap.disk_percent));
        assert!(snap.memory_used_mb >= 0.0);
    }
}
