//! Provisioning and exec, routed through the broker or run locally.
//!
//! Broker exec is acknowledged on receipt and keeps running broker-side, so
//! only local exec returns output. [`ExecOutcome::synchronous`] says which
//! one happened.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{BrokerClient, BrokerError};
use crate::runtime::{DriverError, ExecLimits, ExitState, SandboxDriver};
use crate::sandbox::CanonicalId;
use crate::security;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// Use the broker when reachable, otherwise run locally.
    #[default]
    Preferred,
    /// Never fall back; an unreachable broker is an error.
    Required,
    /// Always run locally.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Broker,
    Local,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("command denied: {reason}")]
    Denied { reason: String },

    #[error("broker is required but unreachable: {0}")]
    BrokerRequired(#[source] BrokerError),

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Captured output of a synchronous exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitState,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    /// False when only receipt was acknowledged; no output is available.
    pub synchronous: bool,
    pub route: Route,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecOutput>,
    /// Broker-side log where asynchronous output ends up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub route: Route,
    /// Whether a new unit was launched. Unknown when the broker did it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

pub struct SandboxControl {
    broker: BrokerClient,
    mode: BrokerMode,
    driver: Arc<SandboxDriver>,
    exec_limits: ExecLimits,
}

impl SandboxControl {
    pub fn new(
        broker: BrokerClient,
        mode: BrokerMode,
        driver: Arc<SandboxDriver>,
        exec_limits: ExecLimits,
    ) -> Self {
        Self {
            broker,
            mode,
            driver,
            exec_limits,
        }
    }

    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    pub fn driver(&self) -> &Arc<SandboxDriver> {
        &self.driver
    }

    /// Decide whether a broker failure falls back to local execution.
    fn fallback(&self, err: BrokerError) -> Result<(), ControlError> {
        match err {
            BrokerError::Unavailable { .. } if self.mode == BrokerMode::Required => {
                Err(ControlError::BrokerRequired(err))
            }
            BrokerError::Unavailable { .. } => {
                info!("Broker unreachable, running locally");
                Ok(())
            }
            other => Err(ControlError::Broker(other)),
        }
    }

    /// Ensure the unit exists and is running.
    pub async fn provision(
        &self,
        id: &CanonicalId,
        original: &str,
        host_path: Option<&str>,
    ) -> Result<Provisioned, ControlError> {
        if self.mode != BrokerMode::Disabled {
            match self.broker.create(id, original, host_path).await {
                Ok(ack) => {
                    return Ok(Provisioned {
                        route: Route::Broker,
                        created: None,
                        log: ack.log,
                    })
                }
                Err(e) => self.fallback(e)?,
            }
        }

        let driver = Arc::clone(&self.driver);
        let id = id.clone();
        let created = tokio::task::spawn_blocking(move || driver.create(&id)).await??;
        Ok(Provisioned {
            route: Route::Local,
            created: Some(created),
            log: None,
        })
    }

    /// Filter `command`, then run it via the broker (acknowledged only) or
    /// locally (with output, bounded by `limits` or the configured default).
    pub async fn exec(
        &self,
        id: &CanonicalId,
        original: &str,
        command: &str,
        cwd: Option<&str>,
        limits: Option<ExecLimits>,
    ) -> Result<ExecOutcome, ControlError> {
        let verdict = security::evaluate(command);
        if !verdict.allowed {
            let reason = verdict.reason.unwrap_or_else(|| "command denied".to_string());
            warn!("Refusing command for {}: {}", id, reason);
            return Err(ControlError::Denied { reason });
        }

        if self.mode != BrokerMode::Disabled {
            match self.broker.exec(id, original, command, cwd).await {
                Ok(ack) => {
                    return Ok(ExecOutcome {
                        synchronous: false,
                        route: Route::Broker,
                        output: None,
                        log: ack.log,
                    })
                }
                Err(e) => self.fallback(e)?,
            }
        }

        let driver = Arc::clone(&self.driver);
        let id = id.clone();
        let command = command.to_string();
        let cwd = cwd.map(str::to_string);
        let limits = limits.unwrap_or(self.exec_limits);
        let out = tokio::task::spawn_blocking(move || {
            driver.exec(&id, &command, cwd.as_deref(), limits)
        })
        .await??;

        Ok(ExecOutcome {
            synchronous: true,
            route: Route::Local,
            output: Some(ExecOutput {
                stdout: out.stdout_lossy(),
                stderr: out.stderr_lossy(),
                exit: out.exit,
                truncated: out.truncated,
            }),
            log: None,
        })
    }
}
