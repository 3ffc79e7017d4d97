use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::process::{ExecLimits, ProcessOutput};
use super::{ExecSpec, LaunchProfile, ProbeReport, Runtime, RuntimeError, UnitState};
use crate::sandbox::identity::{CanonicalId, UnitNamer};

/// Writes stdin (base64) to `$1`, creating parent directories.
const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && base64 -d > "$1""#;

/// Creates an empty file at `$1`, creating parent directories.
const TOUCH_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && touch "$1""#;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path contains a NUL byte")]
    Nul,
    #[error("refusing to operate on the sandbox root")]
    Root,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("sandbox unit '{unit}' does not exist")]
    UnitMissing { unit: String },

    #[error("sandbox unit '{unit}' did not reach running state within {waited:?}")]
    NotRunning { unit: String, waited: Duration },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("'{path}' not found in sandbox")]
    FileNotFound { path: String },

    #[error("'{path}' exceeds the transfer limit")]
    TooLarge { path: String },

    #[error("{op} failed in sandbox: {stderr}")]
    Failed { op: &'static str, stderr: String },

    #[error("invalid file data: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Kind of item to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One entry of a bounded tree listing, relative to the listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub depth: usize,
}

/// Anchor `rel` under `root`, dropping empty, `.` and `..` segments so the
/// result can never leave the root.
pub fn anchor_path(root: &str, rel: &str) -> Result<String, PathError> {
    if rel.contains('\0') {
        return Err(PathError::Nul);
    }
    let segments: Vec<&str> = rel
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    let root = root.trim_end_matches('/');
    if segments.is_empty() {
        return Ok(if root.is_empty() { "/".to_string() } else { root.to_string() });
    }
    Ok(format!("{}/{}", root, segments.join("/")))
}

/// Container operations with ensure-running semantics, anchored paths and
/// base64 file transfer.
pub struct SandboxDriver {
    runtime: Arc<dyn Runtime>,
    namer: UnitNamer,
    profile: LaunchProfile,
    root: String,
    settle: Duration,
    start_timeout: Duration,
    file_limits: ExecLimits,
    ignored_dirs: Vec<String>,
}

impl SandboxDriver {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        namer: UnitNamer,
        profile: LaunchProfile,
        root: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            namer,
            profile,
            root: root.into(),
            settle: Duration::from_secs(3),
            start_timeout: Duration::from_secs(30),
            file_limits: ExecLimits::new(Duration::from_secs(30), 16 * 1024 * 1024),
            ignored_dirs: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "vendor".to_string(),
                "__pycache__".to_string(),
                ".cache".to_string(),
            ],
        }
    }

    pub fn with_timing(mut self, settle: Duration, start_timeout: Duration) -> Self {
        self.settle = settle;
        self.start_timeout = start_timeout;
        self
    }

    pub fn with_file_limits(mut self, limits: ExecLimits) -> Self {
        self.file_limits = limits;
        self
    }

    pub fn with_ignored_dirs(mut self, dirs: Vec<String>) -> Self {
        self.ignored_dirs = dirs;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn unit_name(&self, id: &CanonicalId) -> String {
        self.namer.unit_name(id)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn anchor(&self, rel: &str) -> Result<String, PathError> {
        anchor_path(&self.root, rel)
    }

    pub fn state(&self, id: &CanonicalId) -> Result<UnitState, DriverError> {
        Ok(self.runtime.state(&self.unit_name(id))?)
    }

    pub fn exists(&self, id: &CanonicalId) -> Result<bool, DriverError> {
        Ok(self.state(id)? != UnitState::Missing)
    }

    pub fn is_running(&self, id: &CanonicalId) -> Result<bool, DriverError> {
        Ok(self.state(id)? == UnitState::Running)
    }

    /// Start the unit if needed and wait for it to settle.
    pub fn ensure_running(&self, id: &CanonicalId) -> Result<(), DriverError> {
        let unit = self.unit_name(id);
        match self.runtime.state(&unit)? {
            UnitState::Running => Ok(()),
            UnitState::Missing => Err(DriverError::UnitMissing { unit }),
            UnitState::Stopped => {
                info!("Starting sandbox unit {}", unit);
                self.runtime.start(&unit)?;
                self.wait_running(&unit)
            }
        }
    }

    /// One settle sleep, then poll with doubling intervals until the timeout.
    fn wait_running(&self, unit: &str) -> Result<(), DriverError> {
        let started = Instant::now();
        thread::sleep(self.settle);
        let mut interval = Duration::from_millis(250);
        loop {
            if self.runtime.state(unit)? == UnitState::Running {
                debug!("{} running after {:?}", unit, started.elapsed());
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.start_timeout {
                warn!("{} not running after {:?}", unit, waited);
                return Err(DriverError::NotRunning {
                    unit: unit.to_string(),
                    waited,
                });
            }
            thread::sleep(interval.min(self.start_timeout.saturating_sub(waited)));
            interval = (interval * 2).min(Duration::from_secs(4));
        }
    }

    /// Create the unit from the template if missing, otherwise make sure it
    /// runs. Returns whether a new unit was launched.
    pub fn create(&self, id: &CanonicalId) -> Result<bool, DriverError> {
        let unit = self.unit_name(id);
        let created = match self.runtime.state(&unit)? {
            UnitState::Missing => {
                info!(
                    "Launching sandbox unit {} from template {}",
                    unit, self.profile.template
                );
                self.runtime.launch(&unit, &self.profile)?;
                if self.runtime.state(&unit)? != UnitState::Running {
                    self.runtime.start(&unit)?;
                    self.wait_running(&unit)?;
                }
                true
            }
            UnitState::Stopped => {
                self.runtime.start(&unit)?;
                self.wait_running(&unit)?;
                false
            }
            UnitState::Running => false,
        };
        let argv = vec!["mkdir".to_string(), "-p".to_string(), self.root.clone()];
        self.checked(&unit, "mkdir", &argv, None)?;
        Ok(created)
    }

    pub fn start(&self, id: &CanonicalId) -> Result<(), DriverError> {
        self.ensure_running(id)
    }

    /// Stop the unit; a missing unit counts as stopped.
    pub fn stop(&self, id: &CanonicalId) -> Result<(), DriverError> {
        let unit = self.unit_name(id);
        if self.runtime.state(&unit)? == UnitState::Running {
            self.runtime.stop(&unit)?;
        }
        Ok(())
    }

    /// Stop and delete. Returns false when there was nothing to delete.
    pub fn delete(&self, id: &CanonicalId) -> Result<bool, DriverError> {
        let unit = self.unit_name(id);
        match self.runtime.state(&unit)? {
            UnitState::Missing => Ok(false),
            UnitState::Running => {
                self.runtime.stop(&unit)?;
                self.runtime.delete(&unit)?;
                Ok(true)
            }
            UnitState::Stopped => {
                self.runtime.delete(&unit)?;
                Ok(true)
            }
        }
    }

    /// Run `command` through the unit's shell. `cwd` is anchored under the root.
    pub fn exec(
        &self,
        id: &CanonicalId,
        command: &str,
        cwd: Option<&str>,
        limits: ExecLimits,
    ) -> Result<ProcessOutput, DriverError> {
        self.ensure_running(id)?;
        let cwd = self.anchor(cwd.unwrap_or(""))?;
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        let spec = ExecSpec {
            argv: &argv,
            cwd: Some(&cwd),
            stdin: None,
            limits,
        };
        Ok(self.runtime.exec(&self.unit_name(id), &spec)?)
    }

    fn run(
        &self,
        unit: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ProcessOutput, DriverError> {
        let spec = ExecSpec {
            argv,
            cwd: None,
            stdin,
            limits: self.file_limits,
        };
        Ok(self.runtime.exec(unit, &spec)?)
    }

    fn checked(
        &self,
        unit: &str,
        op: &'static str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ProcessOutput, DriverError> {
        let out = self.run(unit, argv, stdin)?;
        if !out.exit.success() {
            return Err(DriverError::Failed {
                op,
                stderr: out.stderr_lossy().trim().to_string(),
            });
        }
        Ok(out)
    }

    pub fn read_file(&self, id: &CanonicalId, rel: &str) -> Result<Vec<u8>, DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor(rel)?;
        let unit = self.unit_name(id);
        let out = self.run(&unit, &["base64".to_string(), path.clone()], None)?;
        if out.truncated {
            return Err(DriverError::TooLarge { path });
        }
        if !out.exit.success() {
            let stderr = out.stderr_lossy();
            if stderr.contains("No such file") {
                return Err(DriverError::FileNotFound { path });
            }
            return Err(DriverError::Failed {
                op: "read",
                stderr: stderr.trim().to_string(),
            });
        }
        let encoded: Vec<u8> = out
            .stdout
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        Ok(STANDARD.decode(encoded)?)
    }

    pub fn write_file(&self, id: &CanonicalId, rel: &str, data: &[u8]) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor(rel)?;
        if path == self.root.trim_end_matches('/') {
            return Err(PathError::Root.into());
        }
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            WRITE_SCRIPT.to_string(),
            "sh".to_string(),
            path,
        ];
        let encoded = STANDARD.encode(data);
        self.checked(&self.unit_name(id), "write", &argv, Some(encoded.as_bytes()))?;
        Ok(())
    }

    /// Tree listing below `rel`, at most `depth` levels, skipping noise dirs.
    pub fn list_files(
        &self,
        id: &CanonicalId,
        rel: &str,
        depth: usize,
    ) -> Result<Vec<FileEntry>, DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor(rel)?;
        let mut argv = vec![
            "find".to_string(),
            path,
            "-mindepth".to_string(),
            "1".to_string(),
            "-maxdepth".to_string(),
            depth.max(1).to_string(),
        ];
        if !self.ignored_dirs.is_empty() {
            argv.push("(".to_string());
            for (i, dir) in self.ignored_dirs.iter().enumerate() {
                if i > 0 {
                    argv.push("-o".to_string());
                }
                argv.push("-name".to_string());
                argv.push(dir.clone());
            }
            argv.push(")".to_string());
            argv.push("-prune".to_string());
            argv.push("-o".to_string());
        }
        argv.push("-printf".to_string());
        argv.push("%y\\t%s\\t%P\\n".to_string());

        let out = self.checked(&self.unit_name(id), "list", &argv, None)?;
        let mut entries = parse_listing(&out.stdout_lossy());
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    pub fn create_item(
        &self,
        id: &CanonicalId,
        rel: &str,
        kind: ItemKind,
    ) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor_non_root(rel)?;
        let argv = match kind {
            ItemKind::Directory => vec!["mkdir".to_string(), "-p".to_string(), path],
            ItemKind::File => vec![
                "sh".to_string(),
                "-c".to_string(),
                TOUCH_SCRIPT.to_string(),
                "sh".to_string(),
                path,
            ],
        };
        self.checked(&self.unit_name(id), "create", &argv, None)?;
        Ok(())
    }

    pub fn delete_item(&self, id: &CanonicalId, rel: &str) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor_non_root(rel)?;
        let argv = vec!["rm".to_string(), "-rf".to_string(), "--".to_string(), path];
        self.checked(&self.unit_name(id), "delete", &argv, None)?;
        Ok(())
    }

    pub fn rename_item(&self, id: &CanonicalId, from: &str, to: &str) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let from = self.anchor_non_root(from)?;
        let to = self.anchor_non_root(to)?;
        let argv = vec!["mv".to_string(), "--".to_string(), from, to];
        self.checked(&self.unit_name(id), "rename", &argv, None)?;
        Ok(())
    }

    pub fn copy_item(&self, id: &CanonicalId, from: &str, to: &str) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let from = self.anchor_non_root(from)?;
        let to = self.anchor_non_root(to)?;
        let argv = vec!["cp".to_string(), "-a".to_string(), "--".to_string(), from, to];
        self.checked(&self.unit_name(id), "copy", &argv, None)?;
        Ok(())
    }

    pub fn path_exists(&self, id: &CanonicalId, rel: &str) -> Result<bool, DriverError> {
        self.ensure_running(id)?;
        let path = self.anchor(rel)?;
        let argv = vec!["test".to_string(), "-e".to_string(), path];
        let out = self.run(&self.unit_name(id), &argv, None)?;
        Ok(out.exit.success())
    }

    pub fn push_file(&self, id: &CanonicalId, local: &Path, rel: &str) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let remote = self.anchor_non_root(rel)?;
        Ok(self.runtime.push_file(&self.unit_name(id), local, &remote)?)
    }

    pub fn pull_file(&self, id: &CanonicalId, rel: &str, local: &Path) -> Result<(), DriverError> {
        self.ensure_running(id)?;
        let remote = self.anchor_non_root(rel)?;
        Ok(self.runtime.pull_file(&self.unit_name(id), &remote, local)?)
    }

    pub fn probe(&self) -> ProbeReport {
        self.runtime.probe(&self.profile.template)
    }

    fn anchor_non_root(&self, rel: &str) -> Result<String, PathError> {
        let path = self.anchor(rel)?;
        if path == self.root.trim_end_matches('/') || path == "/" {
            return Err(PathError::Root);
        }
        Ok(path)
    }
}

fn parse_listing(output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let kind = match parts.next()? {
                "d" => EntryKind::Directory,
                "f" => EntryKind::File,
                "l" => EntryKind::Symlink,
                _ => EntryKind::Other,
            };
            let size = parts.next()?.parse().unwrap_or(0);
            let path = parts.next()?.to_string();
            if path.is_empty() {
                return None;
            }
            let depth = path.matches('/').count() + 1;
            Some(FileEntry {
                path,
                kind,
                size,
                depth,
            })
        })
        .collect()
}
