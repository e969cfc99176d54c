//! Self-healing health supervisor
//!
//! One long-lived polling loop that probes the application, watches host
//! resources and memory trends, protects the disk, keeps dependent
//! services alive and writes a periodic report. Recovery escalates through
//! an explicit state machine: Healthy -> Healing -> Escalating, with the
//! escalation driven by a consecutive-failure counter rather than
//! recursion. The supervisor shares nothing with the request path beyond a
//! read-only handle on the threat engine.

mod cleanup;
mod leak;

pub use cleanup::{run_disk_cleanup, CleanupConfig, CleanupOutcome};
pub use leak::LeakWindow;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

use crate::external::{AlertSeverity, AlertSink, HealthProbe, ResourceSampler, ServiceControl};
use crate::models::{HealthReport, ResourceSnapshot};
use crate::observability::DefenseMetrics;
use crate::persist::ReportWriter;
use crate::threat::ThreatEngine;

/// Supervisor recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorPhase {
    Healthy,
    Healing,
    Escalating,
}

impl std::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorPhase::Healthy => write!(f, "healthy"),
            SupervisorPhase::Healing => write!(f, "healing"),
            SupervisorPhase::Escalating => write!(f, "escalating"),
        }
    }
}

/// Tunables for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Poll loop interval
    pub poll_interval: Duration,
    /// Wait between remediation and the verification probe
    pub settle_delay: Duration,
    /// Consecutive failed verifications before escalating
    pub escalate_after: u32,
    /// CPU percentage flagged as critical
    pub cpu_threshold: f64,
    /// Memory percentage flagged as critical
    pub memory_threshold: f64,
    /// Disk percentage that triggers the cleanup sequence
    pub disk_cleanup_threshold: f64,
    /// Cadence of the structured health report
    pub report_interval: Duration,
    /// Application backend service name
    pub backend_service: String,
    /// Reverse proxy service name
    pub proxy_service: String,
    /// Port the application listens on, for escalated recovery
    pub app_port: u16,
    /// Leak window capacity (samples)
    pub leak_window: usize,
    /// Leak slope threshold, MB per sample
    pub leak_slope_mb: f64,
    /// Disk cleanup tunables
    pub cleanup: CleanupConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(10),
            escalate_after: 3,
            cpu_threshold: 90.0,
            memory_threshold: 88.0,
            disk_cleanup_threshold: 85.0,
            report_interval: Duration::from_secs(300),
            backend_service: "backend.service".to_string(),
            proxy_service: "nginx".to_string(),
            app_port: 8_000,
            leak_window: 12,
            leak_slope_mb: 1.5,
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Self-healing supervisor. Owns its state exclusively; constructed once
/// and consumed by [`HealthSupervisor::run`].
pub struct HealthSupervisor {
    config: SupervisorConfig,
    probe: Arc<dyn HealthProbe>,
    control: Arc<dyn ServiceControl>,
    alerts: Arc<dyn AlertSink>,
    sampler: Arc<dyn ResourceSampler>,
    threat: Option<Arc<ThreatEngine>>,
    report_writer: Option<ReportWriter>,
    metrics: DefenseMetrics,

    phase: SupervisorPhase,
    leak_window: LeakWindow,
    failures: u64,
    heals: u64,
    alert_count: u64,
    consecutive_failures: u32,
    last_heal: Option<DateTime<Utc>>,
    last_report: Option<Instant>,
    last_probe_ok: bool,
}

impl HealthSupervisor {
    pub fn new(
        config: SupervisorConfig,
        probe: Arc<dyn HealthProbe>,
        control: Arc<dyn ServiceControl>,
        alerts: Arc<dyn AlertSink>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        let leak_window = LeakWindow::new(config.leak_window, config.leak_slope_mb);
        Self {
            config,
            probe,
            control,
            alerts,
            sampler,
            threat: None,
            report_writer: None,
            metrics: DefenseMetrics::new(),
            phase: SupervisorPhase::Healthy,
            leak_window,
            failures: 0,
            heals: 0,
            alert_count: 0,
            consecutive_failures: 0,
            last_heal: None,
            last_report: None,
            last_probe_ok: true,
        }
    }

    /// Let the supervisor read the composite threat score for its report.
    pub fn with_threat_engine(mut self, threat: Arc<ThreatEngine>) -> Self {
        self.threat = Some(threat);
        self
    }

    /// Enable the periodic structured report.
    pub fn with_report_writer(mut self, writer: ReportWriter) -> Self {
        self.report_writer = Some(writer);
        self
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    /// Supervision loop. Runs until shutdown; a failed iteration is logged
    /// and the loop resumes on the next tick.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            backend = %self.config.backend_service,
            proxy = %self.config.proxy_service,
            "Starting health supervisor"
        );

        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health supervisor");
                    break;
                }
            }
        }
    }

    /// One supervision iteration.
    async fn tick(&mut self) {
        // 1. Application health
        let probe_result = self.probe.check().await;
        self.last_probe_ok = probe_result.ok;
        if !probe_result.ok {
            let reason = probe_result.reason.as_deref().unwrap_or("unknown");
            self.heal(&format!("API unhealthy: {reason}")).await;
        }

        // 2. Host resources
        let resources = self.sample_resources();
        if resources.cpu_percent > self.config.cpu_threshold
            || resources.memory_percent > self.config.memory_threshold
        {
            warn!(
                cpu = resources.cpu_percent,
                memory = resources.memory_percent,
                "Resource threshold exceeded"
            );
            self.notify(
                &format!(
                    "Resource pressure: cpu {:.1}%, memory {:.1}%",
                    resources.cpu_percent, resources.memory_percent
                ),
                AlertSeverity::Warning,
            )
            .await;
        }

        // 3. Memory leak trend
        if let Some(slope) = self.leak_window.record(resources.memory_used_mb) {
            warn!(slope_mb_per_sample = slope, "Memory leak trend detected");
            self.notify(
                &format!("Memory leak trend: {slope:.2} MB per sample and climbing"),
                AlertSeverity::Critical,
            )
            .await;
        }

        // 4. Disk protection
        if resources.disk_percent > self.config.disk_cleanup_threshold {
            warn!(disk = resources.disk_percent, "Disk usage high, running cleanup");
            let outcomes = run_disk_cleanup(&self.config.cleanup).await;
            let failed = outcomes.iter().filter(|o| !o.ok).count();
            if failed > 0 {
                warn!(failed, "Some cleanup actions failed");
            }
        }

        // 5. Service liveness
        for service in [
            self.config.backend_service.clone(),
            self.config.proxy_service.clone(),
        ] {
            if !self.control.is_active(&service).await {
                self.heal(&format!("Service {service} not running")).await;
            }
        }

        // 6. Periodic report
        let report_due = self
            .last_report
            .map(|at| at.elapsed() >= self.config.report_interval)
            .unwrap_or(true);
        if report_due {
            self.write_report(resources).await;
            self.last_report = Some(Instant::now());
        }
    }

    /// Recovery entry point. Verification failures accumulate; the
    /// `escalate_after`-th consecutive failure fires exactly one escalated
    /// pass and resets the counter whatever its outcome.
    async fn heal(&mut self, reason: &str) {
        self.phase = SupervisorPhase::Healing;
        let verified = self.remediate(reason, false).await;

        if verified {
            self.consecutive_failures = 0;
            self.phase = SupervisorPhase::Healthy;
            return;
        }

        self.consecutive_failures += 1;
        warn!(
            consecutive = self.consecutive_failures,
            threshold = self.config.escalate_after,
            "Recovery verification failed"
        );

        if self.consecutive_failures >= self.config.escalate_after {
            self.consecutive_failures = 0;
            self.phase = SupervisorPhase::Escalating;
            self.metrics.inc_escalations();
            let verified = self.remediate(reason, true).await;
            if verified {
                self.phase = SupervisorPhase::Healthy;
            } else {
                error!("Escalated recovery failed, manual intervention needed");
            }
        }
    }

    /// Perform one remediation pass and verify it. The escalated path
    /// clears the listening port before restarting both services
    /// unconditionally; the normal path restarts only what is down.
    async fn remediate(&mut self, reason: &str, escalate: bool) -> bool {
        self.failures += 1;
        self.metrics.inc_heals();
        let severity = if escalate {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        warn!(reason, escalate, "Healing triggered");
        self.notify(&format!("Healing triggered: {reason}"), severity)
            .await;

        let services = [
            self.config.backend_service.clone(),
            self.config.proxy_service.clone(),
        ];

        if escalate {
            // Clears port-already-in-use zombies before the restarts.
            let killed = self.control.kill_process_on_port(self.config.app_port).await;
            info!(port = self.config.app_port, killed, "Cleared application port");
            for service in &services {
                let outcome = self.control.restart(service).await;
                if !outcome.ok {
                    error!(service = %service, message = %outcome.message, "Restart failed");
                }
            }
        } else {
            for service in &services {
                if !self.control.is_active(service).await {
                    let outcome = self.control.restart(service).await;
                    if !outcome.ok {
                        error!(service = %service, message = %outcome.message, "Restart failed");
                    }
                }
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;

        let verification = self.probe.check().await;
        if verification.ok {
            self.heals += 1;
            self.last_heal = Some(Utc::now());
            info!(reason, escalate, "Recovery verified");
            true
        } else {
            error!(
                reason,
                escalate,
                verify_reason = verification.reason.as_deref().unwrap_or("unknown"),
                "Recovery verification failed"
            );
            false
        }
    }

    fn sample_resources(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: self.sampler.cpu_percent(),
            memory_percent: self.sampler.memory_percent(),
            disk_percent: self.sampler.disk_percent(),
            memory_used_mb: self.sampler.memory_used_mb(),
            open_connections: self.sampler.open_connections(),
        }
    }

    async fn notify(&mut self, message: &str, severity: AlertSeverity) {
        self.alert_count += 1;
        self.alerts.notify(message, severity).await;
    }

    async fn write_report(&mut self, resources: ResourceSnapshot) {
        let threat_score = self.threat.as_ref().map(|t| {
            let score = t.calculate_threat_score();
            self.metrics.set_threat_score(score.score as i64);
            score.score
        });
        if let Some(threat) = &self.threat {
            self.metrics.set_active_bans(threat.active_ban_count() as i64);
        }

        let report = HealthReport {
            timestamp: Utc::now(),
            api_healthy: self.last_probe_ok,
            resources,
            failures: self.failures,
            heals: self.heals,
            alerts: self.alert_count,
            consecutive_failures: self.consecutive_failures,
            last_heal: self.last_heal,
            phase: self.phase.to_string(),
            threat_score,
        };

        info!(
            failures = report.failures,
            heals = report.heals,
            alerts = report.alerts,
            phase = %report.phase,
            "Supervision report"
        );
        if let Some(writer) = &self.report_writer {
            writer.save(&report).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{async_trait, ProbeOutcome, RestartOutcome};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedProbe {
        ok: AtomicBool,
    }

    impl ScriptedProbe {
        fn healthy() -> Self {
            Self {
                ok: AtomicBool::new(true),
            }
        }

        fn failing() -> Self {
            Self {
                ok: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self) -> ProbeOutcome {
            if self.ok.load(Ordering::SeqCst) {
                ProbeOutcome::healthy()
            } else {
                ProbeOutcome::failed("connection refused")
            }
        }
    }

    #[derive(Default)]
    struct MockControl {
        active: AtomicBool,
        restarts: AtomicUsize,
        kills: AtomicUsize,
    }

    #[async_trait]
    impl ServiceControl for MockControl {
        async fn is_active(&self, _service: &str) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        async fn restart(&self, service: &str) -> RestartOutcome {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            RestartOutcome {
                ok: true,
                message: format!("{service} restarted"),
            }
        }

        async fn kill_process_on_port(&self, _port: u16) -> bool {
            self.kills.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Default)]
    struct CountingSink {
        critical: AtomicUsize,
        warning: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn notify(&self, _message: &str, severity: AlertSeverity) {
            match severity {
                AlertSeverity::Critical => self.critical.fetch_add(1, Ordering::SeqCst),
                _ => self.warning.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    struct FixedSampler {
        cpu: f64,
        memory: f64,
        disk: f64,
        memory_mb: f64,
    }

    impl FixedSampler {
        fn calm() -> Self {
            Self {
                cpu: 10.0,
                memory: 20.0,
                disk: 30.0,
                memory_mb: 512.0,
            }
        }
    }

    impl ResourceSampler for FixedSampler {
        fn cpu_percent(&self) -> f64 {
            self.cpu
        }
        fn memory_percent(&self) -> f64 {
            self.memory
        }
        fn disk_percent(&self) -> f64 {
            self.disk
        }
        fn memory_used_mb(&self) -> f64 {
            self.memory_mb
        }
        fn open_connections(&self) -> usize {
            0
        }
    }

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig {
            settle_delay: Duration::from_millis(1),
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(
        config: SupervisorConfig,
        probe: Arc<ScriptedProbe>,
        control: Arc<MockControl>,
        sink: Arc<CountingSink>,
    ) -> HealthSupervisor {
        HealthSupervisor::new(
            config,
            probe,
            control,
            sink,
            Arc::new(FixedSampler::calm()),
        )
    }

    #[tokio::test]
    async fn test_successful_heal_resets_counter() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe, control.clone(), sink);

        sup.heal("test failure").await;

        assert_eq!(sup.phase(), SupervisorPhase::Healthy);
        assert_eq!(sup.consecutive_failures, 0);
        assert_eq!(sup.heals, 1);
        // Services report active, so nothing is restarted.
        assert_eq!(control.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inactive_services_restarted() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let control = Arc::new(MockControl::default());
        control.active.store(false, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe, control.clone(), sink);

        sup.heal("backend down").await;

        // Both dependent services were down and restarted.
        assert_eq!(control.restarts.load(Ordering::SeqCst), 2);
        assert_eq!(control.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_third_failed_verification_escalates_once() {
        let probe = Arc::new(ScriptedProbe::failing());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe, control.clone(), sink.clone());

        sup.heal("api down").await;
        assert_eq!(sup.consecutive_failures, 1);
        assert_eq!(control.kills.load(Ordering::SeqCst), 0);

        sup.heal("api down").await;
        assert_eq!(sup.consecutive_failures, 2);

        sup.heal("api down").await;

        // Exactly one escalated pass: the port was cleared, both services
        // restarted unconditionally, and the counter reset even though the
        // escalated verification failed too.
        assert_eq!(control.kills.load(Ordering::SeqCst), 1);
        assert_eq!(control.restarts.load(Ordering::SeqCst), 2);
        assert_eq!(sup.consecutive_failures, 0);
        assert_eq!(sup.phase(), SupervisorPhase::Escalating);
        assert_eq!(sink.critical.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_escalated_recovery_returns_to_healthy() {
        let probe = Arc::new(ScriptedProbe::failing());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe.clone(), control.clone(), sink);

        sup.heal("api down").await;
        sup.heal("api down").await;

        // The application comes back right before the escalated pass
        // verifies.
        probe.ok.store(true, Ordering::SeqCst);
        sup.heal("api down").await;

        assert_eq!(control.kills.load(Ordering::SeqCst), 0);
        assert_eq!(sup.phase(), SupervisorPhase::Healthy);
    }

    #[tokio::test]
    async fn test_tick_heals_when_probe_fails() {
        let probe = Arc::new(ScriptedProbe::failing());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe, control, sink.clone());

        sup.tick().await;

        assert_eq!(sup.failures, 1);
        assert_eq!(sup.consecutive_failures, 1);
        assert!(sink.warning.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_tick_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let probe = Arc::new(ScriptedProbe::healthy());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let mut sup = supervisor(quick_config(), probe, control, sink)
            .with_report_writer(ReportWriter::new(&path));

        sup.tick().await;

        let data = tokio::fs::read_to_string(&path).await.unwrap();
        let report: HealthReport = serde_json::from_str(&data).unwrap();
        assert!(report.api_healthy);
        assert_eq!(report.phase, "healthy");
    }

    /// Sampler whose memory reading climbs 100 MB on every poll.
    struct ClimbingSampler {
        mb: AtomicUsize,
    }

    impl ResourceSampler for ClimbingSampler {
        fn cpu_percent(&self) -> f64 {
            10.0
        }
        fn memory_percent(&self) -> f64 {
            20.0
        }
        fn disk_percent(&self) -> f64 {
            30.0
        }
        fn memory_used_mb(&self) -> f64 {
            self.mb.fetch_add(100, Ordering::SeqCst) as f64
        }
        fn open_connections(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_leak_trend_raises_critical_alert() {
        let probe = Arc::new(ScriptedProbe::healthy());
        let control = Arc::new(MockControl::default());
        control.active.store(true, Ordering::SeqCst);
        let sink = Arc::new(CountingSink::default());
        let config = SupervisorConfig {
            leak_window: 3,
            ..quick_config()
        };
        let mut sup = HealthSupervisor::new(
            config,
            probe,
            control,
            sink.clone(),
            Arc::new(ClimbingSampler {
                mb: AtomicUsize::new(1_000),
            }),
        );

        sup.tick().await;
        sup.tick().await;
        assert_eq!(sink.critical.load(Ordering::SeqCst), 0);

        // Third poll fills the leak window; 100 MB/sample is a leak.
        sup.tick().await;
        assert_eq!(sink.critical.load(Ordering::SeqCst), 1);
    }
}
