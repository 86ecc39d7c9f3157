//! Control of the service that serves the published release.

use std::time::Duration;

use async_trait::async_trait;

use crate::command::{shell_quote, Shell};
use crate::error::ServiceError;

/// Stop/start for the consuming service. Both operations are idempotent.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> Result<(), ServiceError>;

    async fn start(&self) -> Result<(), ServiceError>;
}

/// A systemd unit managed through `sudo -n systemctl`.
pub struct SystemdService {
    unit: String,
    shell: Shell,
    timeout: Duration,
}

impl SystemdService {
    pub fn new(unit: impl Into<String>, shell: Shell, timeout: Duration) -> Self {
        Self {
            unit: unit.into(),
            shell,
            timeout,
        }
    }

    async fn systemctl(&self, verb: &str) -> Result<(), String> {
        let script = format!("sudo -n systemctl {verb} {}", shell_quote(&self.unit));
        let output = self
            .shell
            .run(&script, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        if output.success() {
            Ok(())
        } else {
            Err(output.reason())
        }
    }
}

#[async_trait]
impl ServiceControl for SystemdService {
    fn name(&self) -> &str {
        &self.unit
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        tracing::info!(host = %self.shell.label(), unit = %self.unit, "Stopping service");
        self.systemctl("stop")
            .await
            .map_err(|reason| ServiceError::StopFailed {
                unit: self.unit.clone(),
                reason,
            })
    }

    async fn start(&self) -> Result<(), ServiceError> {
        tracing::info!(host = %self.shell.label(), unit = %self.unit, "Starting service");
        self.systemctl("start")
            .await
            .map_err(|reason| ServiceError::StartFailed {
                unit: self.unit.clone(),
                reason,
            })
    }
}

/// No service to manage; the alias is repointed without a restart.
pub struct NoService;

#[async_trait]
impl ServiceControl for NoService {
    fn name(&self) -> &str {
        "none"
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}
