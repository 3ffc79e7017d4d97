//! Newline-delimited JSON protocol between the web process and the broker.
//!
//! One request and one response per connection, no session state.

use serde::{Deserialize, Serialize};

pub const ACTION_CREATE: &str = "create";
pub const ACTION_EXEC: &str = "exec";

/// Request sent by the unprivileged caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRequest {
    /// Kept as a string so unknown actions get a precise error code.
    pub action: String,
    pub sandbox_id: String,
    /// Raw id before canonicalization, for audit logs.
    #[serde(default)]
    pub original_sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl BrokerRequest {
    pub fn create(sandbox_id: &str, original: &str, host_path: Option<&str>) -> Self {
        Self {
            action: ACTION_CREATE.to_string(),
            sandbox_id: sandbox_id.to_string(),
            original_sandbox_id: original.to_string(),
            host_path: host_path.map(str::to_string),
            command: None,
            cwd: None,
        }
    }

    pub fn exec(sandbox_id: &str, original: &str, command: &str, cwd: Option<&str>) -> Self {
        Self {
            action: ACTION_EXEC.to_string(),
            sandbox_id: sandbox_id.to_string(),
            original_sandbox_id: original.to_string(),
            host_path: None,
            command: Some(command.to_string()),
            cwd: cwd.map(str::to_string),
        }
    }
}

/// Error codes the broker reports in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    UnknownAction,
    InvalidSandboxId,
    CommandDenied,
    HelperMissing,
    SudoUnavailable,
    CreateFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::UnknownAction => "unknown_action",
            ErrorCode::InvalidSandboxId => "invalid_sandbox_id",
            ErrorCode::CommandDenied => "command_denied",
            ErrorCode::HelperMissing => "helper_missing",
            ErrorCode::SudoUnavailable => "sudo_unavailable",
            ErrorCode::CreateFailed => "create_failed",
            ErrorCode::Internal => "internal",
        }
    }
}

/// `{"ok":true,"sandboxId":..,"log":..}` or `{"error":..,"message":..}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerResponse {
    #[serde(default, skip_serializing_if = "is_false")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl BrokerResponse {
    pub fn success(sandbox_id: &str, log: Option<String>) -> Self {
        Self {
            ok: true,
            sandbox_id: Some(sandbox_id.to_string()),
            log,
            ..Self::default()
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(code.as_str().to_string()),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Serialize as one protocol line, newline included.
pub fn to_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
