//! Core library for the warden defense agent
//!
//! This crate provides the runtime defense and resilience layer:
//! - Threat detection (bans, bursts, payload inspection, threat score)
//! - Sliding-window rate limiting with attack mode and a circuit breaker
//! - Statistical anomaly detection over resource metrics
//! - A self-healing supervisor for the monitored application
//! - Collaborator traits for probes, service control, alerting, sampling

pub mod anomaly;
pub mod external;
pub mod gate;
pub mod models;
pub mod observability;
pub mod persist;
pub mod ratelimit;
pub mod supervisor;
pub mod threat;

pub use anomaly::{AnalysisResult, AnomalyConfig, AnomalyDetector, AnomalyEvent};
pub use gate::{AdmissionGate, AdmissionOutcome};
pub use models::{HealthReport, ResourceSnapshot};
pub use observability::DefenseMetrics;
pub use ratelimit::{classify, AdmissionDecision, RateCategory, RateLimiter, RateLimiterConfig};
pub use supervisor::{HealthSupervisor, SupervisorConfig, SupervisorPhase};
pub use threat::{AttackKind, ThreatConfig, ThreatEngine, ThreatScore};
