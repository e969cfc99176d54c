//! Threat detection
//!
//! This module provides:
//! - Failed-login tracking and escalating IP bans
//! - Request-burst (DDoS) detection
//! - Payload inspection against ordered attack pattern classes
//! - Honeypot hit tracking and a composite threat score

mod engine;
mod payload;

pub use engine::{
    run_sweeper, BannedIp, HitCount, HoneypotHit, HoneypotStats, PayloadHit, ThreatConfig,
    ThreatEngine, ThreatFactor, ThreatLevel, ThreatScore,
};
pub use payload::{AttackKind, PayloadInspector};
