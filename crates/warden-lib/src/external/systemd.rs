//! Service control via systemd
//!
//! Shells out to `systemctl` and `fuser`. Every invocation runs under a
//! timeout so a wedged init system cannot stall the supervisor loop.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use super::{async_trait, RestartOutcome, ServiceControl};

/// Default ceiling for a single control command.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// [`ServiceControl`] implementation backed by systemd.
pub struct SystemdControl {
    command_timeout: Duration,
}

impl SystemdControl {
    pub fn new() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Option<std::process::Output> {
        let fut = Command::new(program).args(args).output();
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                warn!(program, error = %e, "Control command failed to spawn");
                None
            }
            Err(_) => {
                warn!(
                    program,
                    timeout_secs = self.command_timeout.as_secs(),
                    "Control command timed out"
                );
                None
            }
        }
    }
}

impl Default for SystemdControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceControl for SystemdControl {
    async fn is_active(&self, service: &str) -> bool {
        match self.run("systemctl", &["is-active", service]).await {
            Some(output) => String::from_utf8_lossy(&output.stdout).trim() == "active",
            None => false,
        }
    }

    async fn restart(&self, service: &str) -> RestartOutcome {
        info!(service, "Restarting service");
        match self.run("systemctl", &["restart", service]).await {
            Some(output) if output.status.success() => RestartOutcome {
                ok: true,
                message: format!("{service} restarted"),
            },
            Some(output) => RestartOutcome {
                ok: false,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            None => RestartOutcome {
                ok: false,
                message: "restart command did not complete".to_string(),
            },
        }
    }

    async fn kill_process_on_port(&self, port: u16) -> bool {
        let target = format!("{port}/tcp");
        info!(port, "Killing process holding port");
        match self.run("fuser", &["-k", &target]).await {
            Some(output) => output.status.success(),
            None => false,
        }
    }
}
