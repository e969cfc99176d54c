//! Agent configuration

use anyhow::Result;
use serde::Deserialize;

/// Agent configuration, sourced from `WARDEN_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Port for the agent's own health/metrics/admin API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Health endpoint of the monitored application
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Probe request timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Application backend systemd unit
    #[serde(default = "default_backend_service")]
    pub backend_service: String,

    /// Reverse proxy systemd unit
    #[serde(default = "default_proxy_service")]
    pub proxy_service: String,

    /// Port the application listens on
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Supervisor poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Resource sampler refresh interval in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Anomaly feed interval in seconds
    #[serde(default = "default_analyze_interval")]
    pub analyze_interval_secs: u64,

    /// Sweep interval for per-IP state in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Attack mode auto-tune interval in seconds
    #[serde(default = "default_autotune_interval")]
    pub autotune_interval_secs: u64,

    /// Ban snapshot location
    #[serde(default = "default_ban_snapshot_path")]
    pub ban_snapshot_path: String,

    /// Health report location
    #[serde(default = "default_report_path")]
    pub report_path: String,

    /// Comma-separated addresses that are never blocked
    #[serde(default = "default_whitelist")]
    pub whitelist: String,

    /// Slack incoming webhook for alerts
    #[serde(default)]
    pub slack_webhook_url: Option<String>,

    /// Telegram bot token for alerts
    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    /// Telegram chat id for alerts
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

fn default_api_port() -> u16 {
    8_090
}

fn default_probe_url() -> String {
    "http://127.0.0.1:8000/health".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_backend_service() -> String {
    "backend.service".to_string()
}

fn default_proxy_service() -> String {
    "nginx".to_string()
}

fn default_app_port() -> u16 {
    8_000
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sample_interval() -> u64 {
    2
}

fn default_analyze_interval() -> u64 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_autotune_interval() -> u64 {
    15
}

fn default_ban_snapshot_path() -> String {
    "/var/lib/warden/bans.json".to_string()
}

fn default_report_path() -> String {
    "/var/lib/warden/health_report.json".to_string()
}

fn default_whitelist() -> String {
    "127.0.0.1,::1".to_string()
}

impl AgentConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WARDEN"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| AgentConfig {
            api_port: default_api_port(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout(),
            backend_service: default_backend_service(),
            proxy_service: default_proxy_service(),
            app_port: default_app_port(),
            poll_interval_secs: default_poll_interval(),
            sample_interval_secs: default_sample_interval(),
            analyze_interval_secs: default_analyze_interval(),
            sweep_interval_secs: default_sweep_interval(),
            autotune_interval_secs: default_autotune_interval(),
            ban_snapshot_path: default_ban_snapshot_path(),
            report_path: default_report_path(),
            whitelist: default_whitelist(),
            slack_webhook_url: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
        }))
    }

    /// The whitelist as individual addresses.
    pub fn whitelist_ips(&self) -> Vec<String> {
        self.whitelist
            .split(',')
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .collect()
    }
}
