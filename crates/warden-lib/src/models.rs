//! Core data models shared across the defense components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of host resource usage.
///
/// Produced by a [`crate::external::ResourceSampler`] and consumed by the
/// threat scorer, the anomaly feed and the health supervisor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Aggregate CPU utilization, 0-100
    pub cpu_percent: f64,
    /// Memory utilization, 0-100
    pub memory_percent: f64,
    /// Root filesystem utilization, 0-100
    pub disk_percent: f64,
    /// Absolute memory in use, MB
    pub memory_used_mb: f64,
    /// Open TCP connections on the host
    pub open_connections: usize,
}

/// Periodic snapshot written by the health supervisor for external
/// consumption. Always reflects the latest poll; no other invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub api_healthy: bool,
    pub resources: ResourceSnapshot,
    pub failures: u64,
    pub heals: u64,
    pub alerts: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heal: Option<DateTime<Utc>>,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_score: Option<u8>,
}
