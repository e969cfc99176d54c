//! Sliding-window admission control
//!
//! Per-IP, per-category request limiting with three tightening layers on
//! top of the static category limits: a global circuit breaker, an attack
//! mode multiplier, and per-IP offense reductions for repeat violators.
//! Windows are pruned lazily on every check and garbage-collected by a
//! background sweeper; a second loop auto-toggles attack mode from CPU
//! pressure with enable/disable hysteresis so it cannot flap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::external::ResourceSampler;

/// Route categories with independent limits. Sensitive routes (login,
/// registration, password reset) are far tighter than generic API traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    Login,
    Register,
    ForgotPassword,
    Websocket,
    Health,
    Api,
    Default,
}

impl RateCategory {
    /// Base (max_requests, window_seconds) for the category.
    pub fn limits(self) -> (usize, i64) {
        match self {
            RateCategory::Login => (5, 60),
            RateCategory::Register => (3, 60),
            RateCategory::ForgotPassword => (3, 300),
            RateCategory::Websocket => (10, 60),
            RateCategory::Health => (120, 60),
            RateCategory::Api => (60, 60),
            RateCategory::Default => (30, 60),
        }
    }

    /// Health/public endpoints stay reachable even with the circuit
    /// breaker open, so probes keep working during an incident.
    pub fn circuit_exempt(self) -> bool {
        matches!(self, RateCategory::Health)
    }
}

impl std::fmt::Display for RateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RateCategory::Login => "login",
            RateCategory::Register => "register",
            RateCategory::ForgotPassword => "forgot_password",
            RateCategory::Websocket => "websocket",
            RateCategory::Health => "health",
            RateCategory::Api => "api",
            RateCategory::Default => "default",
        };
        write!(f, "{name}")
    }
}

/// Map a request to its category. Most specific match first; the generic
/// `/api/` prefix comes last among the API routes.
pub fn classify(path: &str, _method: &str) -> RateCategory {
    let path = path.to_ascii_lowercase();
    if path.contains("/api/auth/login") {
        RateCategory::Login
    } else if path.contains("/api/auth/register") {
        RateCategory::Register
    } else if path.contains("/api/auth/forgot-password") {
        RateCategory::ForgotPassword
    } else if path.starts_with("/ws") {
        RateCategory::Websocket
    } else if path == "/" || path == "/health" || path == "/healthz" {
        RateCategory::Health
    } else if path.starts_with("/api/") {
        RateCategory::Api
    } else {
        RateCategory::Default
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub category: RateCategory,
    pub limit: usize,
    pub remaining: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Rate limiter statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    pub active_ips: usize,
    pub tracked_entries: usize,
    pub total_blocked: u64,
    pub attack_mode: bool,
    pub circuit_breaker_open: bool,
    pub top_blocked: Vec<BlockedCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedCount {
    pub ip: String,
    pub blocked: u32,
}

/// Tunables for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Multiplier applied to every category limit under attack mode
    pub attack_mode_factor: f64,
    /// Offense count at which an IP's limits are halved
    pub halve_offenses: u32,
    /// Offense count at which an IP's limits are quartered
    pub quarter_offenses: u32,
    /// Retry hint handed out while the circuit breaker is open, seconds
    pub circuit_retry_secs: i64,
    /// Window retention used by the background sweep, seconds
    pub sweep_retention_secs: i64,
    /// CPU percentage above which attack mode engages
    pub attack_enable_cpu: f64,
    /// CPU percentage below which attack mode disengages
    pub attack_disable_cpu: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            attack_mode_factor: 0.4,
            halve_offenses: 5,
            quarter_offenses: 10,
            circuit_retry_secs: 30,
            sweep_retention_secs: 120,
            // Double threshold so a load spike cannot make the mode flap.
            attack_enable_cpu: 90.0,
            attack_disable_cpu: 60.0,
        }
    }
}

#[derive(Default)]
struct RateState {
    windows: HashMap<(String, RateCategory), Vec<i64>>,
    offenses: HashMap<String, u32>,
}

/// Sliding-window rate limiter shared between the admission path and the
/// background maintenance loops.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<RateState>,
    attack_mode: AtomicBool,
    circuit_open: AtomicBool,
    total_blocked: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RateState::default()),
            attack_mode: AtomicBool::new(false),
            circuit_open: AtomicBool::new(false),
            total_blocked: AtomicU64::new(0),
        }
    }

    /// Check one request. Prunes the IP+category window, applies the
    /// breaker/attack/offense tightening layers, then admits or rejects.
    pub fn check(&self, ip: &str, category: RateCategory) -> AdmissionDecision {
        self.check_at(ip, category, Utc::now().timestamp())
    }

    fn check_at(&self, ip: &str, category: RateCategory, now: i64) -> AdmissionDecision {
        let (base_limit, window) = category.limits();

        if self.circuit_open.load(Ordering::Relaxed) && !category.circuit_exempt() {
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
            return AdmissionDecision {
                allowed: false,
                category,
                limit: base_limit,
                remaining: 0,
                retry_after_secs: Some(self.config.circuit_retry_secs),
                reason: Some("circuit_breaker"),
            };
        }

        let mut limit = base_limit;
        if self.attack_mode.load(Ordering::Relaxed) {
            limit = ((limit as f64 * self.config.attack_mode_factor).floor() as usize).max(1);
        }

        let mut state = self.state.lock().unwrap();

        let offenses = state.offenses.get(ip).copied().unwrap_or(0);
        if offenses >= self.config.quarter_offenses {
            limit = (limit / 4).max(1);
        } else if offenses >= self.config.halve_offenses {
            limit = (limit / 2).max(1);
        }

        let key = (ip.to_string(), category);
        let timestamps = state.windows.entry(key).or_default();
        timestamps.retain(|ts| now - ts < window);

        if timestamps.len() >= limit {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = window - (now - oldest) + 1;
            *state.offenses.entry(ip.to_string()).or_default() += 1;
            self.total_blocked.fetch_add(1, Ordering::Relaxed);
            debug!(ip, category = %category, limit, "Request rate limited");
            return AdmissionDecision {
                allowed: false,
                category,
                limit,
                remaining: 0,
                retry_after_secs: Some(retry_after),
                reason: Some("rate_limited"),
            };
        }

        timestamps.push(now);
        let remaining = limit - timestamps.len();
        AdmissionDecision {
            allowed: true,
            category,
            limit,
            remaining,
            retry_after_secs: None,
            reason: None,
        }
    }

    /// Engage or release attack mode. Idempotent; logs on change only.
    pub fn set_attack_mode(&self, active: bool) {
        let was = self.attack_mode.swap(active, Ordering::Relaxed);
        if was != active {
            if active {
                warn!("Attack mode engaged, tightening all rate limits");
            } else {
                info!("Attack mode released");
            }
        }
    }

    pub fn attack_mode(&self) -> bool {
        self.attack_mode.load(Ordering::Relaxed)
    }

    /// Open or close the global circuit breaker. Idempotent; logs on
    /// change only.
    pub fn set_circuit_breaker(&self, open: bool) {
        let was = self.circuit_open.swap(open, Ordering::Relaxed);
        if was != open {
            if open {
                warn!("Circuit breaker opened, rejecting non-exempt traffic");
            } else {
                info!("Circuit breaker closed");
            }
        }
    }

    pub fn circuit_breaker_open(&self) -> bool {
        self.circuit_open.load(Ordering::Relaxed)
    }

    /// Current statistics for the admin surface.
    pub fn status(&self) -> RateLimiterStatus {
        let state = self.state.lock().unwrap();
        let mut active_ips: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut tracked_entries = 0;
        for ((ip, _), timestamps) in &state.windows {
            if !timestamps.is_empty() {
                active_ips.insert(ip.as_str());
                tracked_entries += timestamps.len();
            }
        }
        let mut top_blocked: Vec<BlockedCount> = state
            .offenses
            .iter()
            .map(|(ip, blocked)| BlockedCount {
                ip: ip.clone(),
                blocked: *blocked,
            })
            .collect();
        top_blocked.sort_by(|a, b| b.blocked.cmp(&a.blocked));
        top_blocked.truncate(10);

        RateLimiterStatus {
            active_ips: active_ips.len(),
            tracked_entries,
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            attack_mode: self.attack_mode(),
            circuit_breaker_open: self.circuit_breaker_open(),
            top_blocked,
        }
    }

    /// Drop window entries beyond the retention bound and remove empty
    /// keys. Called by the background sweeper.
    pub fn sweep(&self) {
        self.sweep_at(Utc::now().timestamp());
    }

    fn sweep_at(&self, now: i64) {
        let retention = self.config.sweep_retention_secs;
        let mut state = self.state.lock().unwrap();
        state.windows.retain(|_, timestamps| {
            timestamps.retain(|ts| now - ts < retention);
            !timestamps.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

/// Periodic window cleanup.
pub async fn run_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = every.as_secs(), "Starting rate limiter sweeper");
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.sweep(),
            _ = shutdown.recv() => {
                info!("Shutting down rate limiter sweeper");
                break;
            }
        }
    }
}

/// CPU-driven attack mode tuning with enable/disable hysteresis.
pub async fn run_auto_tuner(
    limiter: Arc<RateLimiter>,
    sampler: Arc<dyn ResourceSampler>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = every.as_secs(), "Starting attack mode auto-tuner");
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cpu = sampler.cpu_percent();
                if cpu > limiter.config.attack_enable_cpu && !limiter.attack_mode() {
                    warn!(cpu, "CPU pressure above threshold, engaging attack mode");
                    limiter.set_attack_mode(true);
                } else if cpu < limiter.config.attack_disable_cpu && limiter.attack_mode() {
                    info!(cpu, "CPU pressure recovered, releasing attack mode");
                    limiter.set_attack_mode(false);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down attack mode auto-tuner");
                break;
            }
        }
    }
}
