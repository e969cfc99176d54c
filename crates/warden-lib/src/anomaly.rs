//! Statistical anomaly detection over resource metrics
//!
//! Z-score analysis over rolling CPU, memory and disk windows. The
//! detector learns a baseline before flagging anything, requires a streak
//! of consecutive breaching samples to suppress single-sample noise, and
//! keeps an exponential moving average per metric for trend display.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use crate::external::{AlertSeverity, AlertSink, ResourceSampler};
use crate::observability::DefenseMetrics;

/// Metrics tracked by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Cpu => write!(f, "cpu"),
            MetricKind::Memory => write!(f, "memory"),
            MetricKind::Disk => write!(f, "disk"),
        }
    }
}

/// Severity of an emitted anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Critical,
    High,
    Medium,
}

/// One detected anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub metric: MetricKind,
    pub value: f64,
    pub expected: f64,
    pub z_score: f64,
    pub severity: AnomalySeverity,
    pub timestamp: DateTime<Utc>,
}

/// Per-metric window statistics reported alongside an analysis.
#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub current: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    pub ema: f64,
}

/// Result of feeding one sample set into the detector.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub learning: bool,
    pub samples: usize,
    pub needed: usize,
    pub anomalies: Vec<AnomalyEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AnalysisStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisStats {
    pub cpu: MetricStats,
    pub memory: MetricStats,
    pub disk: MetricStats,
}

/// Detector state summary for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub learning: bool,
    pub samples: usize,
    pub window_size: usize,
    pub z_threshold: f64,
    pub total_checks: u64,
    pub total_anomalies: u64,
    pub streaks: StreakSet,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreakSet {
    pub cpu: u32,
    pub memory: u32,
    pub disk: u32,
}

/// Tunables for the detector.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Samples kept per metric window
    pub window_size: usize,
    /// Z-score threshold for CPU and memory
    pub z_threshold: f64,
    /// Multiplier on the threshold for disk, whose usage moves step-wise
    pub disk_threshold_multiplier: f64,
    /// Samples required before detection starts
    pub min_samples: usize,
    /// Consecutive breaching samples required before an anomaly is emitted
    pub streak_threshold: u32,
    /// Absolute value above which severity becomes critical
    pub critical_ceiling: f64,
    /// Span for the exponential moving average
    pub ema_span: usize,
    /// Anomaly history capacity
    pub history_cap: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 120,
            z_threshold: 2.5,
            disk_threshold_multiplier: 1.5,
            min_samples: 20,
            streak_threshold: 3,
            critical_ceiling: 90.0,
            ema_span: 12,
            history_cap: 200,
        }
    }
}

struct MetricWindow {
    kind: MetricKind,
    values: VecDeque<f64>,
    streak: u32,
}

impl MetricWindow {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            values: VecDeque::new(),
            streak: 0,
        }
    }

    fn push(&mut self, value: f64, cap: usize) {
        while self.values.len() >= cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

struct DetectorState {
    cpu: MetricWindow,
    memory: MetricWindow,
    disk: MetricWindow,
    history: VecDeque<AnomalyEvent>,
    total_checks: u64,
    total_anomalies: u64,
}

/// Online Z-score anomaly detector. One periodic sampler drives `analyze`;
/// status and history reads are safe to call concurrently with it.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    state: Mutex<DetectorState>,
    started_at: DateTime<Utc>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        info!(
            window = config.window_size,
            z_threshold = config.z_threshold,
            min_samples = config.min_samples,
            "Anomaly detector initialized"
        );
        Self {
            state: Mutex::new(DetectorState {
                cpu: MetricWindow::new(MetricKind::Cpu),
                memory: MetricWindow::new(MetricKind::Memory),
                disk: MetricWindow::new(MetricKind::Disk),
                history: VecDeque::new(),
                total_checks: 0,
                total_anomalies: 0,
            }),
            config,
            started_at: Utc::now(),
        }
    }

    /// Feed one sample per metric and evaluate. Returns a learning result
    /// with no anomalies until the windows hold `min_samples` values.
    pub fn analyze(&self, cpu: f64, memory: f64, disk: f64) -> AnalysisResult {
        let config = &self.config;
        let mut state = self.state.lock().unwrap();
        state.total_checks += 1;

        state.cpu.push(cpu, config.window_size);
        state.memory.push(memory, config.window_size);
        state.disk.push(disk, config.window_size);

        let samples = state.cpu.values.len();
        if samples < config.min_samples {
            return AnalysisResult {
                learning: true,
                samples,
                needed: config.min_samples,
                anomalies: Vec::new(),
                stats: None,
            };
        }

        let state = &mut *state;
        let mut anomalies = Vec::new();
        let cpu_stats = evaluate(&mut state.cpu, cpu, config, 1.0, &mut anomalies);
        let memory_stats = evaluate(&mut state.memory, memory, config, 1.0, &mut anomalies);
        let disk_stats = evaluate(
            &mut state.disk,
            disk,
            config,
            config.disk_threshold_multiplier,
            &mut anomalies,
        );

        for anomaly in &anomalies {
            state.total_anomalies += 1;
            warn!(
                metric = %anomaly.metric,
                value = anomaly.value,
                expected = anomaly.expected,
                z_score = anomaly.z_score,
                severity = ?anomaly.severity,
                "Anomaly detected"
            );
            while state.history.len() >= config.history_cap {
                state.history.pop_front();
            }
            state.history.push_back(anomaly.clone());
        }

        AnalysisResult {
            learning: false,
            samples,
            needed: config.min_samples,
            anomalies,
            stats: Some(AnalysisStats {
                cpu: cpu_stats,
                memory: memory_stats,
                disk: disk_stats,
            }),
        }
    }

    /// Past anomalies, newest first.
    pub fn history(&self) -> Vec<AnomalyEvent> {
        let state = self.state.lock().unwrap();
        state.history.iter().rev().cloned().collect()
    }

    /// Current detector status.
    pub fn status(&self) -> DetectorStatus {
        let state = self.state.lock().unwrap();
        DetectorStatus {
            learning: state.cpu.values.len() < self.config.min_samples,
            samples: state.cpu.values.len(),
            window_size: self.config.window_size,
            z_threshold: self.config.z_threshold,
            total_checks: state.total_checks,
            total_anomalies: state.total_anomalies,
            streaks: StreakSet {
                cpu: state.cpu.streak,
                memory: state.memory.streak,
                disk: state.disk.streak,
            },
            started_at: self.started_at,
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyConfig::default())
    }
}

/// Periodic feed: samples resources into the detector and pushes critical
/// anomalies to the alert sink.
pub async fn run_feed(
    detector: Arc<AnomalyDetector>,
    sampler: Arc<dyn ResourceSampler>,
    alerts: Arc<dyn AlertSink>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = every.as_secs(), "Starting anomaly feed");
    let metrics = DefenseMetrics::new();
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = detector.analyze(
                    sampler.cpu_percent(),
                    sampler.memory_percent(),
                    sampler.disk_percent(),
                );
                for anomaly in &result.anomalies {
                    metrics.inc_anomalies_detected();
                    if anomaly.severity == AnomalySeverity::Critical {
                        alerts
                            .notify(
                                &format!(
                                    "{} anomaly: {:.1} (expected {:.1}, z {:.2})",
                                    anomaly.metric, anomaly.value, anomaly.expected, anomaly.z_score
                                ),
                                AlertSeverity::Critical,
                            )
                            .await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down anomaly feed");
                break;
            }
        }
    }
}

/// Evaluate one metric window: update the streak and emit an anomaly once
/// the streak reaches the debounce threshold.
fn evaluate(
    window: &mut MetricWindow,
    value: f64,
    config: &AnomalyConfig,
    threshold_multiplier: f64,
    anomalies: &mut Vec<AnomalyEvent>,
) -> MetricStats {
    let (mean, std_dev) = mean_and_std(&window.values);
    let z_score = if std_dev > f64::EPSILON {
        (value - mean).abs() / std_dev
    } else {
        0.0
    };
    let ema = exponential_moving_average(&window.values, config.ema_span);

    let threshold = config.z_threshold * threshold_multiplier;
    if z_score > threshold {
        window.streak += 1;
        if window.streak >= config.streak_threshold {
            let severity = if value > config.critical_ceiling {
                AnomalySeverity::Critical
            } else if window.kind == MetricKind::Disk {
                AnomalySeverity::Medium
            } else {
                AnomalySeverity::High
            };
            anomalies.push(AnomalyEvent {
                metric: window.kind,
                value,
                expected: mean,
                z_score,
                severity,
                timestamp: Utc::now(),
            });
        }
    } else {
        window.streak = 0;
    }

    MetricStats {
        current: value,
        mean,
        std_dev,
        z_score,
        ema,
    }
}

/// Sample mean and Bessel-corrected standard deviation.
fn mean_and_std(values: &VecDeque<f64>) -> (f64, f64) {
    let n = values.len();
    if n < 2 {
        return (values.front().copied().unwrap_or(0.0), 0.0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, variance.sqrt())
}

/// Exponential moving average with alpha = 2 / (span + 1).
fn exponential_moving_average(values: &VecDeque<f64>, span: usize) -> f64 {
    let Some(first) = values.front() else {
        return 0.0;
    };
    let alpha = 2.0 / (span as f64 + 1.0);
    values
        .iter()
        .skip(1)
        .fold(*first, |ema, v| alpha * v + (1.0 - alpha) * ema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::default()
    }

    /// Warm a detector past its learning phase with a flat baseline.
    fn warmed(baseline: f64) -> AnomalyDetector {
        let detector = detector();
        for _ in 0..20 {
            detector.analyze(baseline, baseline, baseline);
        }
        detector
    }

    #[test]
    fn test_learning_phase_reports_no_anomalies() {
        let detector = detector();
        for i in 0..19 {
            let result = detector.analyze(1_000.0, 1_000.0, 1_000.0);
            assert!(result.learning);
            assert_eq!(result.samples, i + 1);
            assert!(result.anomalies.is_empty());
        }
        assert!(detector.status().learning);
    }

    #[test]
    fn test_single_outlier_is_debounced() {
        let detector = warmed(10.0);
        let result = detector.analyze(1_000.0, 10.0, 10.0);
        assert!(!result.learning);
        assert!(result.anomalies.is_empty());
        assert_eq!(detector.status().streaks.cpu, 1);

        // A normal sample resets the streak.
        detector.analyze(10.0, 10.0, 10.0);
        assert_eq!(detector.status().streaks.cpu, 0);
    }

    #[test]
    fn test_streak_of_outliers_emits_one_anomaly() {
        let detector = warmed(10.0);

        assert!(detector.analyze(1_000.0, 10.0, 10.0).anomalies.is_empty());
        assert!(detector.analyze(1_000.0, 10.0, 10.0).anomalies.is_empty());
        let third = detector.analyze(1_000.0, 10.0, 10.0);
        assert_eq!(third.anomalies.len(), 1);

        let anomaly = &third.anomalies[0];
        assert_eq!(anomaly.metric, MetricKind::Cpu);
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
        assert!(anomaly.z_score > 2.5);

        let history = detector.history();
        assert_eq!(history.len(), 1);
        assert_eq!(detector.status().total_anomalies, 1);
    }

    #[test]
    fn test_high_severity_below_ceiling() {
        // Baseline 10 with an outlier at 80: anomalous but below the
        // critical ceiling.
        let detector = warmed(10.0);
        detector.analyze(80.0, 10.0, 10.0);
        detector.analyze(80.0, 10.0, 10.0);
        let result = detector.analyze(80.0, 10.0, 10.0);
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].severity, AnomalySeverity::High);
    }

    #[test]
    fn test_disk_uses_higher_threshold() {
        let detector = warmed(10.0);

        // Identical deviations on cpu and disk: with a 20-sample baseline
        // the z sequence runs 4.36, 3.09, 2.53 as the window absorbs the
        // outliers. That clears the 2.5 cpu threshold every time but falls
        // under the 3.75 disk threshold from the second sample on.
        detector.analyze(80.0, 10.0, 80.0);
        detector.analyze(80.0, 10.0, 80.0);
        let third = detector.analyze(80.0, 10.0, 80.0);

        assert_eq!(third.anomalies.len(), 1);
        assert_eq!(third.anomalies[0].metric, MetricKind::Cpu);
        assert_eq!(detector.status().streaks.disk, 0);
    }

    #[test]
    fn test_disk_anomaly_is_medium() {
        // A longer baseline keeps the z-score above the disk threshold for
        // a full streak.
        let detector = detector();
        for _ in 0..50 {
            detector.analyze(50.0, 50.0, 50.0);
        }
        detector.analyze(50.0, 50.0, 85.0);
        detector.analyze(50.0, 50.0, 85.0);
        let result = detector.analyze(50.0, 50.0, 85.0);
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].metric, MetricKind::Disk);
        assert_eq!(result.anomalies[0].severity, AnomalySeverity::Medium);
    }

    #[test]
    fn test_stats_math() {
        let mut values: VecDeque<f64> = VecDeque::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            values.push_back(v);
        }
        let (mean, std) = mean_and_std(&values);
        assert!((mean - 5.0).abs() < 1e-9);
        // Bessel-corrected: variance 32/7
        assert!((std - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_zero_variance_yields_zero_z() {
        let detector = warmed(10.0);
        let result = detector.analyze(10.0, 10.0, 10.0);
        let stats = result.stats.unwrap();
        assert_eq!(stats.cpu.z_score, 0.0);
        assert_eq!(stats.cpu.mean, 10.0);
    }

    #[test]
    fn test_ema_weights_recent_values() {
        let mut values: VecDeque<f64> = VecDeque::new();
        for _ in 0..10 {
            values.push_back(10.0);
        }
        for _ in 0..10 {
            values.push_back(50.0);
        }
        let ema = exponential_moving_average(&values, 12);
        let (mean, _) = mean_and_std(&values);
        assert!(ema > mean, "EMA {ema} should sit above the plain mean {mean}");
    }

    #[test]
    fn test_sustained_outliers_emit_once_per_run() {
        // Ten consecutive outliers: the streak emits at its third sample,
        // then the window absorbs the new level and the z-score drops back
        // under the threshold. Exactly one event for the whole run.
        let detector = warmed(10.0);
        for _ in 0..10 {
            detector.analyze(1_000.0, 10.0, 10.0);
        }
        assert_eq!(detector.history().len(), 1);
        assert_eq!(detector.status().total_anomalies, 1);
    }
}
