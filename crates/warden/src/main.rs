//! Warden - self-healing infrastructure defense agent
//!
//! Runs the threat engine, rate limiter, anomaly detector and health
//! supervisor as one process next to the monitored application, and
//! exposes admission checks, status and admin controls over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_lib::{
    anomaly,
    external::{
        AlertSink, CachedSampler, HttpProbe, ResourceSampler, SystemdControl, WebhookAlertSink,
    },
    persist::{self, BanStore, ReportWriter},
    ratelimit,
    supervisor::SupervisorConfig,
    threat, AdmissionGate, AnomalyConfig, AnomalyDetector, HealthSupervisor, RateLimiter,
    RateLimiterConfig, ThreatConfig, ThreatEngine,
};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting warden");

    let config = config::AgentConfig::load()?;
    info!(
        api_port = config.api_port,
        probe_url = %config.probe_url,
        backend = %config.backend_service,
        "Agent configured"
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    // Host resource sampling feeds every other component.
    let sampler = Arc::new(CachedSampler::new());
    tokio::spawn(sampler.clone().run(
        Duration::from_secs(config.sample_interval_secs),
        shutdown_tx.subscribe(),
    ));

    // Threat engine with ban state restored from the last run.
    let ban_store = BanStore::new(&config.ban_snapshot_path);
    let restored = ban_store.load().await;
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
    let threat_engine = Arc::new(
        ThreatEngine::new(ThreatConfig::default(), sampler.clone() as Arc<dyn ResourceSampler>)
            .with_snapshot_channel(snapshot_tx),
    );
    threat_engine.restore(restored);
    tokio::spawn(persist::run_snapshot_writer(ban_store, snapshot_rx));
    tokio::spawn(threat::run_sweeper(
        threat_engine.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_tx.subscribe(),
    ));

    // Rate limiter with its maintenance loops.
    let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
    tokio::spawn(ratelimit::run_sweeper(
        limiter.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(ratelimit::run_auto_tuner(
        limiter.clone(),
        sampler.clone(),
        Duration::from_secs(config.autotune_interval_secs),
        shutdown_tx.subscribe(),
    ));

    // Alert delivery shared by the anomaly feed and the supervisor.
    let alerts: Arc<dyn AlertSink> = Arc::new(WebhookAlertSink::new(
        config.slack_webhook_url.clone(),
        config.telegram_bot_token.clone(),
        config.telegram_chat_id.clone(),
    )?);

    // Anomaly detection over the sampled metrics.
    let detector = Arc::new(AnomalyDetector::new(AnomalyConfig::default()));
    tokio::spawn(anomaly::run_feed(
        detector.clone(),
        sampler.clone(),
        alerts.clone(),
        Duration::from_secs(config.analyze_interval_secs),
        shutdown_tx.subscribe(),
    ));

    // Self-healing supervisor.
    let probe = Arc::new(HttpProbe::new(
        &config.probe_url,
        Duration::from_secs(config.probe_timeout_secs),
    )?);
    let supervisor_config = SupervisorConfig {
        poll_interval: Duration::from_secs(config.poll_interval_secs),
        backend_service: config.backend_service.clone(),
        proxy_service: config.proxy_service.clone(),
        app_port: config.app_port,
        ..SupervisorConfig::default()
    };
    let supervisor = HealthSupervisor::new(
        supervisor_config,
        probe,
        Arc::new(SystemdControl::new()),
        alerts,
        sampler.clone(),
    )
    .with_threat_engine(threat_engine.clone())
    .with_report_writer(ReportWriter::new(&config.report_path));
    tokio::spawn(supervisor.run(shutdown_tx.subscribe()));

    // Admission gate for the fronting request layer.
    let gate = Arc::new(
        AdmissionGate::new(limiter.clone(), threat_engine.clone())
            .with_whitelist(config.whitelist_ips()),
    );

    let app_state = Arc::new(api::AppState {
        gate,
        threat: threat_engine,
        limiter,
        detector,
    });
    tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("SIGINT received, shutting down");
    let _ = shutdown_tx.send(());

    Ok(())
}
