//! Central threat detection engine
//!
//! Tracks failed logins and request bursts per IP, bans offenders on an
//! escalating duration ladder, records honeypot and payload-attack hits,
//! and computes a weighted composite threat score. All per-IP state sits
//! behind one coarse mutex; every operation prunes the windows it touches
//! and runs in bounded time, so the engine is safe on the admission path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::payload::{AttackKind, PayloadInspector};
use crate::external::ResourceSampler;
use crate::persist::{BanSnapshot, PersistedBan};

/// Tunables for the threat engine.
#[derive(Debug, Clone)]
pub struct ThreatConfig {
    /// Failed logins within the window that trigger a ban
    pub max_failed_logins: usize,
    /// Rolling window for failed-login tracking, seconds
    pub failed_login_window_secs: i64,
    /// Hard cap on stored failed-login timestamps per IP
    pub failed_window_cap: usize,
    /// Sliding window for burst detection, seconds
    pub burst_window_secs: i64,
    /// Requests per second above which a burst is declared
    pub burst_threshold_rps: f64,
    /// Hard cap on stored burst timestamps per IP
    pub burst_window_cap: usize,
    /// Ban durations in seconds, indexed by prior offense count
    pub ban_ladder_secs: Vec<i64>,
    /// Ring buffer capacity for honeypot hits
    pub honeypot_cap: usize,
    /// Ring buffer capacity for payload hits
    pub payload_cap: usize,
    /// Divisor normalizing the open-connection count into a 0-100 score
    pub connection_divisor: f64,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            max_failed_logins: 5,
            failed_login_window_secs: 300,
            failed_window_cap: 200,
            burst_window_secs: 10,
            burst_threshold_rps: 100.0,
            burst_window_cap: 4096,
            // 1 hour, 6 hours, 24 hours, 7 days
            ban_ladder_secs: vec![3_600, 21_600, 86_400, 604_800],
            honeypot_cap: 2_000,
            payload_cap: 500,
            connection_divisor: 5.0,
        }
    }
}

/// A honeypot endpoint hit. Honeypot paths have no legitimate traffic.
#[derive(Debug, Clone, Serialize)]
pub struct HoneypotHit {
    pub ip: String,
    pub path: String,
    pub timestamp: i64,
    pub user_agent: String,
}

/// A payload that matched an attack pattern class.
#[derive(Debug, Clone, Serialize)]
pub struct PayloadHit {
    pub ip: String,
    pub kind: AttackKind,
    pub path: String,
    pub timestamp: i64,
}

/// One currently-banned IP, for admin inspection.
#[derive(Debug, Clone, Serialize)]
pub struct BannedIp {
    pub ip: String,
    pub failed_attempts: usize,
    pub offense_count: u32,
    pub expires_in_secs: i64,
}

/// Threat level buckets over the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => ThreatLevel::Critical,
            60..=79 => ThreatLevel::High,
            40..=59 => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        }
    }
}

/// One normalized factor feeding the composite score.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatFactor {
    pub name: &'static str,
    pub value: f64,
    pub score: f64,
    pub weight: u32,
}

/// Composite threat score result.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatScore {
    pub score: u8,
    pub level: ThreatLevel,
    pub factors: Vec<ThreatFactor>,
    pub kill_switch_active: bool,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate honeypot statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HoneypotStats {
    pub total_hits: usize,
    pub unique_attacker_ips: usize,
    pub top_attackers: Vec<HitCount>,
    pub top_paths: Vec<HitCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HitCount {
    pub name: String,
    pub hits: usize,
}

#[derive(Debug, Default)]
struct BanRecord {
    failed: VecDeque<i64>,
    ban_until: Option<i64>,
    offense_count: u32,
}

impl BanRecord {
    fn ban_active(&self, now: i64) -> bool {
        self.ban_until.map(|until| now < until).unwrap_or(false)
    }
}

#[derive(Default)]
struct ThreatState {
    records: HashMap<String, BanRecord>,
    bursts: HashMap<String, VecDeque<i64>>,
    honeypot_hits: VecDeque<HoneypotHit>,
    payload_hits: VecDeque<PayloadHit>,
}

/// Threat detection engine. One instance is shared (via `Arc`) between the
/// admission path, the admin surface and the background sweeper.
pub struct ThreatEngine {
    config: ThreatConfig,
    inspector: PayloadInspector,
    state: Mutex<ThreatState>,
    kill_switch: AtomicBool,
    sampler: Arc<dyn ResourceSampler>,
    snapshot_tx: Option<mpsc::UnboundedSender<BanSnapshot>>,
}

impl ThreatEngine {
    pub fn new(config: ThreatConfig, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            config,
            inspector: PayloadInspector::new(),
            state: Mutex::new(ThreatState::default()),
            kill_switch: AtomicBool::new(false),
            sampler,
            snapshot_tx: None,
        }
    }

    /// Attach the channel the persistence writer drains. Every ban event
    /// sends a full snapshot; a closed channel is ignored.
    pub fn with_snapshot_channel(mut self, tx: mpsc::UnboundedSender<BanSnapshot>) -> Self {
        self.snapshot_tx = Some(tx);
        self
    }

    /// Seed ban state from a loaded snapshot. Entries already expired are
    /// skipped.
    pub fn restore(&self, snapshot: BanSnapshot) {
        let now = unix_now();
        let mut state = self.state.lock().unwrap();
        let mut restored = 0;
        for (ip, entry) in snapshot {
            if entry.ban_until > now {
                state.records.insert(
                    ip,
                    BanRecord {
                        failed: VecDeque::new(),
                        ban_until: Some(entry.ban_until),
                        offense_count: entry.offense_count,
                    },
                );
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "Restored ban state from snapshot");
        }
    }

    // ── Failed logins ────────────────────────────────────────────────────

    /// Record a failed login for an IP. Returns true when the attempt
    /// pushed the IP over the threshold and it is now banned.
    pub fn record_failed_login(&self, ip: &str) -> bool {
        self.record_failed_login_at(ip, unix_now())
    }

    fn record_failed_login_at(&self, ip: &str, now: i64) -> bool {
        let (banned, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let window = self.config.failed_login_window_secs;
            let cap = self.config.failed_window_cap;
            let record = state.records.entry(ip.to_string()).or_default();

            prune_window(&mut record.failed, now - window);
            while record.failed.len() >= cap {
                record.failed.pop_front();
            }
            record.failed.push_back(now);
            let attempts = record.failed.len();

            if attempts >= self.config.max_failed_logins && !record.ban_active(now) {
                let until = apply_ban(record, &self.config.ban_ladder_secs, now);
                let offense = record.offense_count;
                warn!(
                    ip,
                    attempts,
                    offense,
                    ban_secs = until - now,
                    "IP banned after repeated failed logins"
                );
                (true, Some(snapshot_of(&state)))
            } else {
                info!(
                    ip,
                    attempts,
                    threshold = self.config.max_failed_logins,
                    "Failed login recorded"
                );
                (false, None)
            }
        };
        if let Some(snap) = snapshot {
            self.persist(snap);
        }
        banned
    }

    /// Clear the failed-attempt window after a successful login. An active
    /// ban is left standing; only expiry or an explicit unban lifts it.
    pub fn record_successful_login(&self, ip: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(ip) {
            record.failed.clear();
        }
    }

    // ── Ban checks ───────────────────────────────────────────────────────

    /// Whether an IP is currently banned, with seconds remaining. An
    /// expired ban is cleared lazily here, along with the attempt window.
    pub fn is_banned(&self, ip: &str) -> (bool, Option<i64>) {
        self.is_banned_at(ip, unix_now())
    }

    fn is_banned_at(&self, ip: &str, now: i64) -> (bool, Option<i64>) {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.records.get_mut(ip) else {
            return (false, None);
        };
        match record.ban_until {
            Some(until) if now < until => (true, Some(until - now)),
            Some(_) => {
                record.ban_until = None;
                record.failed.clear();
                (false, None)
            }
            None => (false, None),
        }
    }

    /// Admin override: lift a ban and clear the attempt window. Returns
    /// false when the IP has never been seen.
    pub fn unban(&self, ip: &str) -> bool {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let Some(record) = state.records.get_mut(ip) else {
                return false;
            };
            record.ban_until = None;
            record.failed.clear();
            info!(ip, "IP manually unbanned");
            snapshot_of(&state)
        };
        self.persist(snapshot);
        true
    }

    // ── Burst detection ──────────────────────────────────────────────────

    /// Track one request in the IP's burst window and auto-ban when the
    /// request rate exceeds the threshold. Returns true when the caller
    /// must reject the request.
    pub fn check_burst(&self, ip: &str) -> bool {
        self.check_burst_at(ip, unix_now())
    }

    fn check_burst_at(&self, ip: &str, now: i64) -> bool {
        let (burst, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let window = self.config.burst_window_secs;
            let cap = self.config.burst_window_cap;

            let timestamps = state.bursts.entry(ip.to_string()).or_default();
            prune_window(timestamps, now - window);
            while timestamps.len() >= cap {
                timestamps.pop_front();
            }
            timestamps.push_back(now);
            let rate = timestamps.len() as f64 / window as f64;

            if rate > self.config.burst_threshold_rps {
                let record = state.records.entry(ip.to_string()).or_default();
                if !record.ban_active(now) {
                    let until = apply_ban(record, &self.config.ban_ladder_secs, now);
                    warn!(
                        ip,
                        rate_rps = rate,
                        offense = record.offense_count,
                        ban_secs = until - now,
                        "IP banned for request burst"
                    );
                    (true, Some(snapshot_of(&state)))
                } else {
                    (true, None)
                }
            } else {
                (false, None)
            }
        };
        if let Some(snap) = snapshot {
            self.persist(snap);
        }
        burst
    }

    // ── Payload inspection ───────────────────────────────────────────────

    /// Inspect a request's path, query and body against the attack pattern
    /// classes. A match records the hit, bans the IP and returns the class.
    pub fn inspect_payload(
        &self,
        ip: &str,
        path: &str,
        query: &str,
        body: &str,
    ) -> Option<AttackKind> {
        self.inspect_payload_at(ip, path, query, body, unix_now())
    }

    fn inspect_payload_at(
        &self,
        ip: &str,
        path: &str,
        query: &str,
        body: &str,
        now: i64,
    ) -> Option<AttackKind> {
        let combined = format!("{path} {query} {body}");
        let kind = self.inspector.classify(&combined)?;

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            push_bounded(
                &mut state.payload_hits,
                PayloadHit {
                    ip: ip.to_string(),
                    kind,
                    path: path.to_string(),
                    timestamp: now,
                },
                self.config.payload_cap,
            );
            let record = state.records.entry(ip.to_string()).or_default();
            let until = apply_ban(record, &self.config.ban_ladder_secs, now);
            warn!(
                ip,
                attack = %kind,
                path,
                offense = record.offense_count,
                ban_secs = until - now,
                "Malicious payload detected, IP banned"
            );
            snapshot_of(&state)
        };
        self.persist(snapshot);
        Some(kind)
    }

    // ── Honeypot ─────────────────────────────────────────────────────────

    /// Record a honeypot hit and ban the source unconditionally.
    pub fn record_honeypot_hit(&self, ip: &str, path: &str, user_agent: &str) {
        self.record_honeypot_hit_at(ip, path, user_agent, unix_now());
    }

    fn record_honeypot_hit_at(&self, ip: &str, path: &str, user_agent: &str, now: i64) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            push_bounded(
                &mut state.honeypot_hits,
                HoneypotHit {
                    ip: ip.to_string(),
                    path: path.to_string(),
                    timestamp: now,
                    user_agent: user_agent.to_string(),
                },
                self.config.honeypot_cap,
            );
            let record = state.records.entry(ip.to_string()).or_default();
            let until = apply_ban(record, &self.config.ban_ladder_secs, now);
            warn!(
                ip,
                path,
                user_agent,
                offense = record.offense_count,
                ban_secs = until - now,
                "Honeypot hit, IP banned"
            );
            snapshot_of(&state)
        };
        self.persist(snapshot);
    }

    // ── Threat score ─────────────────────────────────────────────────────

    /// Weighted composite threat score over resource pressure and attack
    /// activity. The kill switch short-circuits to 100/critical.
    pub fn calculate_threat_score(&self) -> ThreatScore {
        self.calculate_threat_score_at(unix_now())
    }

    fn calculate_threat_score_at(&self, now: i64) -> ThreatScore {
        if self.kill_switch.load(Ordering::Relaxed) {
            return ThreatScore {
                score: 100,
                level: ThreatLevel::Critical,
                factors: Vec::new(),
                kill_switch_active: true,
                timestamp: Utc::now(),
            };
        }

        let cpu = self.sampler.cpu_percent();
        let memory = self.sampler.memory_percent();
        let connections = self.sampler.open_connections();

        let (banned, honeypot_1h, payload_1h) = {
            let state = self.state.lock().unwrap();
            let banned = state.records.values().filter(|r| r.ban_active(now)).count();
            let cutoff = now - 3_600;
            let honeypot = state
                .honeypot_hits
                .iter()
                .filter(|h| h.timestamp > cutoff)
                .count();
            let payload = state
                .payload_hits
                .iter()
                .filter(|h| h.timestamp > cutoff)
                .count();
            (banned, honeypot, payload)
        };

        let factors = vec![
            ThreatFactor {
                name: "cpu",
                value: cpu,
                score: cpu.min(100.0),
                weight: 15,
            },
            ThreatFactor {
                name: "memory",
                value: memory,
                score: memory.min(100.0),
                weight: 15,
            },
            ThreatFactor {
                name: "network_connections",
                value: connections as f64,
                score: (connections as f64 / self.config.connection_divisor).min(100.0),
                weight: 20,
            },
            ThreatFactor {
                name: "banned_ips",
                value: banned as f64,
                score: ((banned * 10) as f64).min(100.0),
                weight: 20,
            },
            ThreatFactor {
                name: "honeypot_hits_1h",
                value: honeypot_1h as f64,
                score: ((honeypot_1h * 5) as f64).min(100.0),
                weight: 15,
            },
            ThreatFactor {
                name: "payload_attacks_1h",
                value: payload_1h as f64,
                score: ((payload_1h * 10) as f64).min(100.0),
                weight: 15,
            },
        ];

        let total_weight: u32 = factors.iter().map(|f| f.weight).sum();
        let weighted: f64 = factors.iter().map(|f| f.score * f.weight as f64).sum();
        let score = (weighted / total_weight as f64).round().clamp(0.0, 100.0) as u8;

        ThreatScore {
            score,
            level: ThreatLevel::from_score(score),
            factors,
            kill_switch_active: false,
            timestamp: Utc::now(),
        }
    }

    // ── Kill switch ──────────────────────────────────────────────────────

    pub fn activate_kill_switch(&self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        error!("Kill switch activated");
    }

    pub fn deactivate_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::Relaxed);
        info!("Kill switch deactivated");
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::Relaxed)
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// All IPs with an active ban.
    pub fn banned_ips(&self) -> Vec<BannedIp> {
        self.banned_ips_at(unix_now())
    }

    fn banned_ips_at(&self, now: i64) -> Vec<BannedIp> {
        let state = self.state.lock().unwrap();
        state
            .records
            .iter()
            .filter_map(|(ip, record)| {
                record.ban_until.filter(|until| now < *until).map(|until| BannedIp {
                    ip: ip.clone(),
                    failed_attempts: record.failed.len(),
                    offense_count: record.offense_count,
                    expires_in_secs: until - now,
                })
            })
            .collect()
    }

    /// Number of IPs with an active ban.
    pub fn active_ban_count(&self) -> usize {
        let now = unix_now();
        let state = self.state.lock().unwrap();
        state.records.values().filter(|r| r.ban_active(now)).count()
    }

    /// Recent honeypot hits, newest first.
    pub fn honeypot_hits(&self, limit: usize) -> Vec<HoneypotHit> {
        let state = self.state.lock().unwrap();
        state.honeypot_hits.iter().rev().take(limit).cloned().collect()
    }

    /// Recent payload hits, newest first.
    pub fn payload_hits(&self, limit: usize) -> Vec<PayloadHit> {
        let state = self.state.lock().unwrap();
        state.payload_hits.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate honeypot statistics: top attackers and targeted paths.
    pub fn honeypot_stats(&self) -> HoneypotStats {
        let state = self.state.lock().unwrap();
        let mut by_ip: HashMap<&str, usize> = HashMap::new();
        let mut by_path: HashMap<&str, usize> = HashMap::new();
        for hit in &state.honeypot_hits {
            *by_ip.entry(hit.ip.as_str()).or_default() += 1;
            *by_path.entry(hit.path.as_str()).or_default() += 1;
        }
        HoneypotStats {
            total_hits: state.honeypot_hits.len(),
            unique_attacker_ips: by_ip.len(),
            top_attackers: top_counts(by_ip, 10),
            top_paths: top_counts(by_path, 10),
        }
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Drop per-IP entries whose windows are empty and whose bans have
    /// expired. Called by the background sweeper.
    pub fn sweep(&self) {
        self.sweep_at(unix_now());
    }

    fn sweep_at(&self, now: i64) {
        let mut state = self.state.lock().unwrap();
        let failed_cutoff = now - self.config.failed_login_window_secs;
        state.records.retain(|_, record| {
            prune_window(&mut record.failed, failed_cutoff);
            !record.failed.is_empty() || record.ban_active(now)
        });
        let burst_cutoff = now - self.config.burst_window_secs;
        state.bursts.retain(|_, timestamps| {
            prune_window(timestamps, burst_cutoff);
            !timestamps.is_empty()
        });
    }

    fn persist(&self, snapshot: BanSnapshot) {
        if let Some(tx) = &self.snapshot_tx {
            // Writer task gone is a shutdown condition, not an error.
            let _ = tx.send(snapshot);
        }
    }
}

/// Periodic garbage collection of idle per-IP state.
pub async fn run_sweeper(
    engine: Arc<ThreatEngine>,
    every: std::time::Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    info!(interval_secs = every.as_secs(), "Starting threat state sweeper");
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => engine.sweep(),
            _ = shutdown.recv() => {
                info!("Shutting down threat state sweeper");
                break;
            }
        }
    }
}

/// Escalation ladder shared by every banning call site: duration indexed by
/// prior offenses, offense count incremented on every ban.
fn apply_ban(record: &mut BanRecord, ladder: &[i64], now: i64) -> i64 {
    let idx = (record.offense_count as usize).min(ladder.len() - 1);
    let until = now + ladder[idx];
    record.offense_count += 1;
    record.ban_until = Some(until);
    until
}

fn snapshot_of(state: &ThreatState) -> BanSnapshot {
    state
        .records
        .iter()
        .filter_map(|(ip, record)| {
            record.ban_until.map(|until| {
                (
                    ip.clone(),
                    PersistedBan {
                        ban_until: until,
                        offense_count: record.offense_count,
                    },
                )
            })
        })
        .collect()
}

fn prune_window(window: &mut VecDeque<i64>, cutoff: i64) {
    while let Some(front) = window.front() {
        if *front <= cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, cap: usize) {
    while buffer.len() >= cap {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

fn top_counts(counts: HashMap<&str, usize>, limit: usize) -> Vec<HitCount> {
    let mut entries: Vec<HitCount> = counts
        .into_iter()
        .map(|(name, hits)| HitCount {
            name: name.to_string(),
            hits,
        })
        .collect();
    entries.sort_by(|a, b| b.hits.cmp(&a.hits));
    entries.truncate(limit);
    entries
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSampler {
        cpu: f64,
        memory: f64,
        disk: f64,
        connections: usize,
    }

    impl StaticSampler {
        fn quiet() -> Self {
            Self {
                cpu: 0.0,
                memory: 0.0,
                disk: 0.0,
                connections: 0,
            }
        }
    }

    impl ResourceSampler for StaticSampler {
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
            0.0
        }
        fn open_connections(&self) -> usize {
            self.connections
        }
    }

    fn engine() -> ThreatEngine {
        ThreatEngine::new(ThreatConfig::default(), Arc::new(StaticSampler::quiet()))
    }

    #[test]
    fn test_ban_after_threshold_failures() {
        let engine = engine();
        let t0 = 1_000_000;

        for i in 0..4 {
            assert!(!engine.record_failed_login_at("10.0.0.5", t0 + i * 10));
        }
        assert!(engine.record_failed_login_at("10.0.0.5", t0 + 50));

        let (banned, remaining) = engine.is_banned_at("10.0.0.5", t0 + 51);
        assert!(banned);
        assert_eq!(remaining, Some(3_600 - 1));

        let banned_ips = engine.banned_ips_at(t0 + 51);
        assert_eq!(banned_ips.len(), 1);
        assert_eq!(banned_ips[0].offense_count, 1);
    }

    #[test]
    fn test_failures_outside_window_do_not_ban() {
        let engine = engine();
        let t0 = 1_000_000;
        // Spread attempts so the rolling window never holds five at once.
        for i in 0..10 {
            assert!(!engine.record_failed_login_at("10.0.0.9", t0 + i * 301));
        }
    }

    #[test]
    fn test_successful_login_clears_window_not_ban() {
        let engine = engine();
        let t0 = 1_000_000;

        for i in 0..5 {
            engine.record_failed_login_at("10.0.0.7", t0 + i);
        }
        assert!(engine.is_banned_at("10.0.0.7", t0 + 10).0);

        // Correct credentials while banned: window clears, ban stands.
        engine.record_successful_login("10.0.0.7");
        let (banned, remaining) = engine.is_banned_at("10.0.0.7", t0 + 20);
        assert!(banned);
        assert!(remaining.unwrap() > 0);
    }

    #[test]
    fn test_second_ban_uses_next_ladder_rung() {
        let engine = engine();
        let t0 = 1_000_000;

        for i in 0..5 {
            engine.record_failed_login_at("10.0.0.8", t0 + i);
        }
        assert!(engine.is_banned_at("10.0.0.8", t0 + 10).0);

        // First ban expires; the lazy check clears it.
        let t1 = t0 + 3_700;
        assert!(!engine.is_banned_at("10.0.0.8", t1).0);

        // A second run of failures escalates to the six-hour rung.
        for i in 0..5 {
            engine.record_failed_login_at("10.0.0.8", t1 + i);
        }
        let (banned, remaining) = engine.is_banned_at("10.0.0.8", t1 + 4);
        assert!(banned);
        assert_eq!(remaining, Some(21_600));
    }

    #[test]
    fn test_unban_clears_immediately() {
        let engine = engine();
        let t0 = 1_000_000;

        for i in 0..5 {
            engine.record_failed_login_at("10.0.0.5", t0 + i * 12);
        }
        let (banned, remaining) = engine.is_banned_at("10.0.0.5", t0 + 60);
        assert!(banned);
        assert!(remaining.unwrap() > 3_500);

        assert!(engine.unban("10.0.0.5"));
        assert_eq!(engine.is_banned_at("10.0.0.5", t0 + 61), (false, None));

        // Unknown IP
        assert!(!engine.unban("192.0.2.1"));
    }

    #[test]
    fn test_burst_detection_bans() {
        let engine = engine();
        let t0 = 1_000_000;

        // 100 req/s over a 10 s window: the 1001st request tips the rate.
        for _ in 0..1_000 {
            assert!(!engine.check_burst_at("203.0.113.4", t0));
        }
        assert!(engine.check_burst_at("203.0.113.4", t0));
        assert!(engine.is_banned_at("203.0.113.4", t0 + 1).0);
    }

    #[test]
    fn test_payload_match_records_and_bans() {
        let engine = engine();
        let kind = engine.inspect_payload_at("198.51.100.2", "/search", "q=' OR 1=1--", "", 1_000);
        assert_eq!(kind, Some(AttackKind::SqlInjection));
        assert!(engine.is_banned_at("198.51.100.2", 1_001).0);

        let hits = engine.payload_hits(10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, AttackKind::SqlInjection);
    }

    #[test]
    fn test_clean_payload_is_ignored() {
        let engine = engine();
        assert_eq!(
            engine.inspect_payload_at("198.51.100.3", "/api/metrics", "window=60", "", 1_000),
            None
        );
        assert!(!engine.is_banned_at("198.51.100.3", 1_001).0);
    }

    #[test]
    fn test_honeypot_hit_always_bans() {
        let engine = engine();
        engine.record_honeypot_hit_at("192.0.2.9", "/wp-admin", "scanner/1.0", 1_000);
        assert!(engine.is_banned_at("192.0.2.9", 1_001).0);

        let hits = engine.honeypot_hits(10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/wp-admin");

        let stats = engine.honeypot_stats();
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.unique_attacker_ips, 1);
        assert_eq!(stats.top_attackers[0].name, "192.0.2.9");
    }

    #[test]
    fn test_threat_score_weighting() {
        let sampler = StaticSampler {
            cpu: 50.0,
            memory: 50.0,
            disk: 0.0,
            connections: 250,
        };
        let engine = ThreatEngine::new(ThreatConfig::default(), Arc::new(sampler));

        let result = engine.calculate_threat_score_at(1_000_000);
        // cpu 50*15 + mem 50*15 + conns (250/5=50)*20 over weight 100
        assert_eq!(result.score, 25);
        assert_eq!(result.level, ThreatLevel::Low);
        assert_eq!(result.factors.len(), 6);
    }

    #[test]
    fn test_threat_score_counts_bans_and_hits() {
        let engine = engine();
        let now = 1_000_000;
        engine.record_honeypot_hit_at("192.0.2.1", "/.env", "", now - 60);
        engine.inspect_payload_at("192.0.2.2", "/x", "q=<script>", "", now - 60);

        let result = engine.calculate_threat_score_at(now);
        // banned 2*10=20 w20, honeypot 1*5=5 w15, payload 1*10=10 w15
        let expected = ((20.0 * 20.0 + 5.0 * 15.0 + 10.0 * 15.0) / 100.0_f64).round() as u8;
        assert_eq!(result.score, expected);
    }

    #[test]
    fn test_kill_switch_overrides_score() {
        let engine = engine();
        engine.activate_kill_switch();
        let result = engine.calculate_threat_score_at(1_000_000);
        assert_eq!(result.score, 100);
        assert_eq!(result.level, ThreatLevel::Critical);
        assert!(result.kill_switch_active);

        engine.deactivate_kill_switch();
        assert!(!engine.kill_switch_active());
        assert!(engine.calculate_threat_score_at(1_000_000).score < 100);
    }

    #[test]
    fn test_sweep_drops_idle_entries() {
        let engine = engine();
        let t0 = 1_000_000;

        engine.record_failed_login_at("10.1.1.1", t0);
        engine.check_burst_at("10.1.1.2", t0);
        for i in 0..5 {
            engine.record_failed_login_at("10.1.1.3", t0 + i);
        }

        // Idle entries age out; the active ban survives.
        engine.sweep_at(t0 + 1_000);
        assert!(engine.is_banned_at("10.1.1.3", t0 + 1_001).0);
        {
            let state = engine.state.lock().unwrap();
            assert!(!state.records.contains_key("10.1.1.1"));
            assert!(state.bursts.is_empty());
            assert!(state.records.contains_key("10.1.1.3"));
        }

        // Once the ban expires the sweep collects the record too.
        engine.sweep_at(t0 + 10_000);
        let state = engine.state.lock().unwrap();
        assert!(!state.records.contains_key("10.1.1.3"));
    }

    #[test]
    fn test_restore_round_trip_preserves_bans() {
        let engine = engine();
        let t0 = unix_now();
        for i in 0..5 {
            engine.record_failed_login_at("10.2.0.1", t0 + i);
        }
        engine.record_honeypot_hit_at("10.2.0.2", "/.env", "scanner/1.0", t0);

        let snapshot = {
            let state = engine.state.lock().unwrap();
            snapshot_of(&state)
        };

        // A fresh engine seeded from the snapshot agrees on every ban.
        let fresh = self::engine();
        fresh.restore(snapshot);
        for ip in ["10.2.0.1", "10.2.0.2"] {
            let (banned, remaining) = fresh.is_banned(ip);
            assert!(banned, "{ip} should still be banned after restore");
            assert!(remaining.unwrap() > 0);
        }

        // Offense history survives too: the next ban escalates.
        let t1 = t0 + 4_000;
        assert!(!fresh.is_banned_at("10.2.0.1", t1).0);
        for i in 0..5 {
            fresh.record_failed_login_at("10.2.0.1", t1 + i);
        }
        assert_eq!(fresh.is_banned_at("10.2.0.1", t1 + 4).1, Some(21_600));
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::persist::BanStore::new(dir.path().join("bans.json"));

        let engine = engine();
        let t0 = unix_now();
        for i in 0..5 {
            engine.record_failed_login_at("10.4.0.1", t0 + i);
        }
        let snapshot = {
            let state = engine.state.lock().unwrap();
            snapshot_of(&state)
        };
        store.save(&snapshot).await;

        // A fresh engine reloading the file agrees on the ban.
        let fresh = self::engine();
        fresh.restore(store.load().await);
        let (banned, remaining) = fresh.is_banned("10.4.0.1");
        assert!(banned);
        assert!(remaining.unwrap() > 0);
    }

    #[test]
    fn test_restore_skips_expired_entries() {
        let mut snapshot = BanSnapshot::new();
        let now = unix_now();
        snapshot.insert(
            "10.3.0.1".to_string(),
            PersistedBan {
                ban_until: now - 100,
                offense_count: 2,
            },
        );
        let engine = engine();
        engine.restore(snapshot);
        assert!(!engine.is_banned("10.3.0.1").0);
        assert!(engine.banned_ips().is_empty());
    }

    #[test]
    fn test_ban_until_increases_across_offenses() {
        let engine = engine();
        let t0 = 1_000_000;
        engine.record_honeypot_hit_at("192.0.2.5", "/.git/config", "", t0);
        let first = engine.is_banned_at("192.0.2.5", t0).1.unwrap();
        engine.record_honeypot_hit_at("192.0.2.5", "/.env", "", t0 + 5);
        let second = engine.is_banned_at("192.0.2.5", t0 + 5).1.unwrap();
        assert!(t0 + 5 + second > t0 + first);
    }
}
