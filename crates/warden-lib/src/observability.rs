//! Observability infrastructure
//!
//! Prometheus metrics for the defense components, registered once through
//! a process-global and exposed by the agent's `/metrics` endpoint.
//! Structured logging happens inline at the call sites with `tracing`.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for admission decision latency (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.000001, 0.000005, 0.00001, 0.000025, 0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DefenseMetricsInner> = OnceLock::new();

struct DefenseMetricsInner {
    admission_checks: IntCounter,
    admission_rejected: IntCounterVec,
    admission_latency_seconds: Histogram,
    bans: IntCounter,
    active_bans: IntGauge,
    threat_score: IntGauge,
    anomalies_detected: IntCounter,
    heals: IntCounter,
    escalations: IntCounter,
}

impl DefenseMetricsInner {
    fn new() -> Self {
        Self {
            admission_checks: register_int_counter!(
                "warden_admission_checks_total",
                "Inbound requests evaluated by the admission gate"
            )
            .expect("Failed to register admission_checks_total"),

            admission_rejected: register_int_counter_vec!(
                "warden_admission_rejected_total",
                "Requests rejected by the admission gate, by reason",
                &["reason"]
            )
            .expect("Failed to register admission_rejected_total"),

            admission_latency_seconds: register_histogram!(
                "warden_admission_latency_seconds",
                "Time spent deciding one admission",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register admission_latency_seconds"),

            bans: register_int_counter!(
                "warden_bans_total",
                "IP bans issued since startup"
            )
            .expect("Failed to register bans_total"),

            active_bans: register_int_gauge!(
                "warden_active_bans",
                "IPs currently under an active ban"
            )
            .expect("Failed to register active_bans"),

            threat_score: register_int_gauge!(
                "warden_threat_score",
                "Latest composite threat score"
            )
            .expect("Failed to register threat_score"),

            anomalies_detected: register_int_counter!(
                "warden_anomalies_detected_total",
                "Resource anomalies emitted by the detector"
            )
            .expect("Failed to register anomalies_detected_total"),

            heals: register_int_counter!(
                "warden_heals_total",
                "Healing attempts performed by the supervisor"
            )
            .expect("Failed to register heals_total"),

            escalations: register_int_counter!(
                "warden_escalations_total",
                "Escalated healing attempts"
            )
            .expect("Failed to register escalations_total"),
        }
    }
}

/// Lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct DefenseMetrics {
    _private: (),
}

impl Default for DefenseMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DefenseMetrics {
    /// Create a metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DefenseMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DefenseMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_admission_checks(&self) {
        self.inner().admission_checks.inc();
    }

    pub fn inc_admission_rejected(&self, reason: &str) {
        self.inner()
            .admission_rejected
            .with_label_values(&[reason])
            .inc();
    }

    pub fn observe_admission_latency(&self, duration_secs: f64) {
        self.inner().admission_latency_seconds.observe(duration_secs);
    }

    pub fn inc_bans(&self) {
        self.inner().bans.inc();
    }

    pub fn set_active_bans(&self, count: i64) {
        self.inner().active_bans.set(count);
    }

    pub fn set_threat_score(&self, score: i64) {
        self.inner().threat_score.set(score);
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_heals(&self) {
        self.inner().heals.inc();
    }

    pub fn inc_escalations(&self) {
        self.inner().escalations.inc();
    }
}
