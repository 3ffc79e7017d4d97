//! Container runtime seam.
//!
//! [`Runtime`] is the black-box container tool; [`SandboxDriver`] layers the
//! ensure-running, path anchoring and byte-safe file transfer rules on top.

pub mod driver;
pub mod lxc;
pub mod process;

#[cfg(test)]
pub(crate) mod fake;

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

pub use driver::{DriverError, EntryKind, FileEntry, ItemKind, SandboxDriver};
pub use lxc::LxcRuntime;
pub use process::{ExecLimits, ExitState, ProcessOutput};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("'{binary}' is not installed or not on PATH")]
    NotInstalled { binary: String },

    #[error("{command} exited with {exit:?}: {stderr}")]
    Command {
        command: String,
        exit: ExitState,
        stderr: String,
    },

    #[error("{command} timed out")]
    Timeout { command: String },

    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of a runtime unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Missing,
    Stopped,
    Running,
}

/// Hardening applied when a unit is launched from the base template.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchProfile {
    pub template: String,
    pub cpu: String,
    pub memory: String,
    pub processes: u32,
    pub nesting: bool,
    /// Syscalls the unit may have intercepted on its behalf (nested containers).
    pub syscall_intercepts: Vec<String>,
}

impl LaunchProfile {
    /// Config key/value pairs set on a freshly launched unit.
    pub fn config_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            ("limits.cpu".to_string(), self.cpu.clone()),
            ("limits.memory".to_string(), self.memory.clone()),
            ("limits.processes".to_string(), self.processes.to_string()),
            ("security.privileged".to_string(), "false".to_string()),
            ("security.idmap.isolated".to_string(), "true".to_string()),
            ("security.nesting".to_string(), self.nesting.to_string()),
        ];
        for syscall in &self.syscall_intercepts {
            entries.push((
                format!("security.syscalls.intercept.{}", syscall),
                "true".to_string(),
            ));
        }
        entries
    }
}

/// One command to run inside a unit.
#[derive(Debug, Clone, Copy)]
pub struct ExecSpec<'a> {
    pub argv: &'a [String],
    pub cwd: Option<&'a str>,
    pub stdin: Option<&'a [u8]>,
    pub limits: ExecLimits,
}

/// Result of the availability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ready,
    NotInstalled,
    NoPrivilege,
    NotInitialized,
    TemplateMissing,
    ExecutionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl ProbeReport {
    pub fn ready(message: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Ready,
            message: message.into(),
            remediation: None,
        }
    }

    pub fn failed(
        status: ProbeStatus,
        message: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            remediation: Some(remediation.into()),
        }
    }

    pub fn available(&self) -> bool {
        self.status == ProbeStatus::Ready
    }
}

/// The underlying container tool. Unit names are already derived.
pub trait Runtime: Send + Sync {
    fn state(&self, unit: &str) -> Result<UnitState, RuntimeError>;

    fn start(&self, unit: &str) -> Result<(), RuntimeError>;

    fn stop(&self, unit: &str) -> Result<(), RuntimeError>;

    fn delete(&self, unit: &str) -> Result<(), RuntimeError>;

    /// Create and start a unit from `profile.template` with its hardening.
    fn launch(&self, unit: &str, profile: &LaunchProfile) -> Result<(), RuntimeError>;

    /// Run a command. A nonzero exit is reported in the output, not as an error.
    fn exec(&self, unit: &str, spec: &ExecSpec<'_>) -> Result<ProcessOutput, RuntimeError>;

    fn push_file(&self, unit: &str, local: &Path, remote: &str) -> Result<(), RuntimeError>;

    fn pull_file(&self, unit: &str, remote: &str, local: &Path) -> Result<(), RuntimeError>;

    /// Address assigned to the unit, if it has one yet.
    fn address(&self, unit: &str) -> Result<Option<Ipv4Addr>, RuntimeError>;

    /// Whether the tool is installed, privileged enough and has its template.
    fn probe(&self, template: &str) -> ProbeReport;
}
