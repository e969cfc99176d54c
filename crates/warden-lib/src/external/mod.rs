//! Collaborator interfaces consumed by the defense core
//!
//! The core never talks to the operating system, the monitored application
//! or a paging channel directly; it goes through these traits. Production
//! implementations live in the submodules, tests substitute mocks.

mod alerts;
mod probe;
mod sampler;
mod systemd;

pub use alerts::{LogAlertSink, WebhookAlertSink};
pub use probe::HttpProbe;
pub use sampler::CachedSampler;
pub use systemd::SystemdControl;

use serde::{Deserialize, Serialize};

pub use async_trait::async_trait;

/// Severity attached to an outbound alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Critical => write!(f, "critical"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Info => write!(f, "info"),
        }
    }
}

/// Result of one application health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of a service restart attempt.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub ok: bool,
    pub message: String,
}

/// Pre-sampled host resource readings.
///
/// Implementations must answer from cached state; these getters sit on the
/// request-admission path (threat scoring) and must not block on syscalls.
pub trait ResourceSampler: Send + Sync {
    fn cpu_percent(&self) -> f64;
    fn memory_percent(&self) -> f64;
    fn disk_percent(&self) -> f64;
    fn memory_used_mb(&self) -> f64;
    fn open_connections(&self) -> usize;
}

/// Control over the services the supervisor keeps alive.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Whether the named service is currently running.
    async fn is_active(&self, service: &str) -> bool;

    /// Restart the named service.
    async fn restart(&self, service: &str) -> RestartOutcome;

    /// Kill whatever process holds the given TCP port. Returns true if a
    /// process was found and signalled.
    async fn kill_process_on_port(&self, port: u16) -> bool;
}

/// Fire-and-forget alert delivery. Implementations swallow delivery
/// failures; a failed notification must never surface to the caller.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, message: &str, severity: AlertSeverity);
}

/// Application liveness probe with a bounded internal timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}
