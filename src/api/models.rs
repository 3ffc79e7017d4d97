//! API request and response models

use serde::{Deserialize, Serialize};

use crate::control::{ExecOutcome, Route};
use crate::runtime::{FileEntry, ItemKind, UnitState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request to find or create the caller's sandbox
#[derive(Debug, Default, Deserialize)]
pub struct CreateSandboxRequest {
    /// Host directory handed to the provisioning helper
    #[serde(default)]
    pub host_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SandboxResponse {
    pub sandbox_id: String,
    pub unit: String,
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SandboxStatusResponse {
    pub sandbox_id: String,
    pub unit: String,
    pub state: Option<UnitState>,
    pub address: Option<String>,
}

/// Request to run a command in a sandbox
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    /// Working directory relative to the sandbox root
    #[serde(default)]
    pub cwd: Option<String>,
    /// Overrides the default exec timeout for local runs
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub type ExecResponse = ExecOutcome;

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_depth() -> usize {
    2
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub path: String,
}

/// File contents travel as base64
#[derive(Debug, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOperation {
    Create {
        path: String,
        #[serde(default = "default_kind")]
        kind: ItemKind,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Copy {
        from: String,
        to: String,
    },
    Exists {
        path: String,
    },
}

fn default_kind() -> ItemKind {
    ItemKind::File
}

#[derive(Debug, Serialize)]
pub struct FileOperationResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}
