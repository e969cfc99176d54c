//! HTTP application health probe

use std::time::Duration;

use super::{async_trait, HealthProbe, ProbeOutcome};

/// GET-based liveness probe against the monitored application's health
/// endpoint.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe with a hard request timeout.
    pub fn new(url: impl Into<String>, probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(probe_timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::healthy(),
            Ok(resp) => ProbeOutcome::failed(format!("HTTP {}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => ProbeOutcome::failed("timeout"),
            Err(e) if e.is_connect() => ProbeOutcome::failed("connection refused"),
            Err(e) => ProbeOutcome::failed(e.to_string()),
        }
    }
}
