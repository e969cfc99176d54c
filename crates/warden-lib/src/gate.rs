//! Admission gate
//!
//! Composes the rate limiter and threat engine into the single check the
//! request-handling layer runs on every inbound call: rate limit first,
//! then ban check, burst check and payload inspection. Whitelisted
//! addresses bypass everything. The whole evaluation is lock-bounded CPU
//! work with no I/O.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::observability::DefenseMetrics;
use crate::ratelimit::{classify, AdmissionDecision, RateLimiter};
use crate::threat::{AttackKind, ThreatEngine};

/// Verdict for one inbound request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    /// Request may proceed to the handler.
    Allowed { decision: AdmissionDecision },
    /// Over the category limit or the circuit breaker is open.
    RateLimited { decision: AdmissionDecision },
    /// The source IP is under an active ban.
    Banned { retry_after_secs: i64 },
    /// The request tipped the source into burst territory.
    Burst,
    /// The payload matched an attack pattern class.
    MaliciousPayload { kind: AttackKind },
}

impl AdmissionOutcome {
    pub fn allowed(&self) -> bool {
        matches!(self, AdmissionOutcome::Allowed { .. })
    }
}

/// Front door for the request-handling layer.
pub struct AdmissionGate {
    limiter: Arc<RateLimiter>,
    threat: Arc<ThreatEngine>,
    whitelist: HashSet<String>,
    metrics: DefenseMetrics,
}

impl AdmissionGate {
    pub fn new(limiter: Arc<RateLimiter>, threat: Arc<ThreatEngine>) -> Self {
        Self {
            limiter,
            threat,
            whitelist: HashSet::new(),
            metrics: DefenseMetrics::new(),
        }
    }

    /// Addresses that are never blocked (operator hosts, local probes).
    pub fn with_whitelist<I: IntoIterator<Item = String>>(mut self, ips: I) -> Self {
        self.whitelist = ips.into_iter().collect();
        self
    }

    /// Evaluate one request.
    pub fn evaluate(
        &self,
        ip: &str,
        path: &str,
        method: &str,
        query: &str,
        body: &str,
    ) -> AdmissionOutcome {
        let started = Instant::now();
        self.metrics.inc_admission_checks();

        let outcome = self.evaluate_inner(ip, path, method, query, body);

        match &outcome {
            AdmissionOutcome::Allowed { .. } => {}
            AdmissionOutcome::RateLimited { decision } => {
                self.metrics
                    .inc_admission_rejected(decision.reason.unwrap_or("rate_limited"));
            }
            AdmissionOutcome::Banned { .. } => self.metrics.inc_admission_rejected("banned"),
            AdmissionOutcome::Burst => self.metrics.inc_admission_rejected("burst"),
            AdmissionOutcome::MaliciousPayload { .. } => {
                self.metrics.inc_admission_rejected("payload")
            }
        }
        self.metrics
            .observe_admission_latency(started.elapsed().as_secs_f64());
        outcome
    }

    fn evaluate_inner(
        &self,
        ip: &str,
        path: &str,
        method: &str,
        query: &str,
        body: &str,
    ) -> AdmissionOutcome {
        let category = classify(path, method);

        if self.whitelist.contains(ip) {
            return AdmissionOutcome::Allowed {
                decision: AdmissionDecision {
                    allowed: true,
                    category,
                    limit: usize::MAX,
                    remaining: usize::MAX,
                    retry_after_secs: None,
                    reason: None,
                },
            };
        }

        let decision = self.limiter.check(ip, category);
        if !decision.allowed {
            return AdmissionOutcome::RateLimited { decision };
        }

        let (banned, remaining) = self.threat.is_banned(ip);
        if banned {
            warn!(ip, remaining_secs = remaining, "Rejected banned IP");
            return AdmissionOutcome::Banned {
                retry_after_secs: remaining.unwrap_or(0),
            };
        }

        if self.threat.check_burst(ip) {
            return AdmissionOutcome::Burst;
        }

        if let Some(kind) = self.threat.inspect_payload(ip, path, query, body) {
            return AdmissionOutcome::MaliciousPayload { kind };
        }

        AdmissionOutcome::Allowed { decision }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ResourceSampler;
    use crate::ratelimit::{RateCategory, RateLimiterConfig};
    use crate::threat::ThreatConfig;

    struct NullSampler;

    impl ResourceSampler for NullSampler {
        fn cpu_percent(&self) -> f64 {
            0.0
        }
        fn memory_percent(&self) -> f64 {
            0.0
        }
        fn disk_percent(&self) -> f64 {
            0.0
        }
        fn memory_used_mb(&self) -> f64 {
            0.0
        }
        fn open_connections(&self) -> usize {
            0
        }
    }

    fn gate() -> AdmissionGate {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
        let threat = Arc::new(ThreatEngine::new(
            ThreatConfig::default(),
            Arc::new(NullSampler),
        ));
        AdmissionGate::new(limiter, threat)
    }

    #[test]
    fn test_clean_request_allowed() {
        let gate = gate();
        let outcome = gate.evaluate("10.0.0.1", "/api/metrics", "GET", "window=60", "");
        assert!(outcome.allowed());
        match outcome {
            AdmissionOutcome::Allowed { decision } => {
                assert_eq!(decision.category, RateCategory::Api);
                assert_eq!(decision.limit, 60);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_checked_before_threat_state() {
        let gate = gate();
        // Exhaust the login allowance.
        for _ in 0..5 {
            assert!(gate
                .evaluate("10.0.0.2", "/api/auth/login", "POST", "", "")
                .allowed());
        }
        let outcome = gate.evaluate("10.0.0.2", "/api/auth/login", "POST", "", "");
        assert!(matches!(outcome, AdmissionOutcome::RateLimited { .. }));
    }

    #[test]
    fn test_banned_ip_rejected() {
        let gate = gate();
        for _ in 0..5 {
            gate.threat.record_failed_login("10.0.0.3");
        }
        let outcome = gate.evaluate("10.0.0.3", "/api/metrics", "GET", "", "");
        match outcome {
            AdmissionOutcome::Banned { retry_after_secs } => assert!(retry_after_secs > 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_malicious_payload_rejected_and_banned() {
        let gate = gate();
        let outcome = gate.evaluate("10.0.0.4", "/search", "GET", "q=' OR 1=1--", "");
        match outcome {
            AdmissionOutcome::MaliciousPayload { kind } => {
                assert_eq!(kind, AttackKind::SqlInjection);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The follow-up request hits the fresh ban.
        let outcome = gate.evaluate("10.0.0.4", "/api/metrics", "GET", "", "");
        assert!(matches!(outcome, AdmissionOutcome::Banned { .. }));
    }

    #[test]
    fn test_whitelisted_ip_bypasses_everything() {
        let gate = gate().with_whitelist(["127.0.0.1".to_string()]);
        for _ in 0..5 {
            gate.threat.record_failed_login("127.0.0.1");
        }
        // Banned and over any limit, yet still admitted.
        for _ in 0..100 {
            assert!(gate
                .evaluate("127.0.0.1", "/api/auth/login", "POST", "", "")
                .allowed());
        }
    }
}
