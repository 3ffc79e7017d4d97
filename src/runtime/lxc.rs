use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use super::process::{run_with_limits, ExecLimits, ProcessOutput};
use super::{ExecSpec, LaunchProfile, ProbeReport, ProbeStatus, Runtime, RuntimeError, UnitState};

/// Cap for status/list output, which is tiny in practice.
const STATUS_OUTPUT_CAP: usize = 1024 * 1024;

/// LXD-backed runtime driving the `lxc` command-line client.
///
/// Every call builds an argument vector and runs it without a host shell.
/// With `use_sudo` the client is invoked as `sudo -n lxc ...`, which fails
/// fast instead of prompting when passwordless elevation is missing.
#[derive(Debug, Clone)]
pub struct LxcRuntime {
    binary: String,
    use_sudo: bool,
    status_timeout: Duration,
    op_timeout: Duration,
}

impl LxcRuntime {
    pub fn new(
        binary: impl Into<String>,
        use_sudo: bool,
        status_timeout: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            use_sudo,
            status_timeout,
            op_timeout,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.binary).args(args);
            cmd
        } else {
            let mut cmd = Command::new(&self.binary);
            cmd.args(args);
            cmd
        }
    }

    fn describe(&self, args: &[String]) -> String {
        let head = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        format!("{} {}", self.binary, head)
    }

    fn run_raw(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
        limits: ExecLimits,
    ) -> Result<ProcessOutput, RuntimeError> {
        run_with_limits(self.command(args), stdin, limits).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::NotInstalled {
                    binary: if self.use_sudo {
                        "sudo".to_string()
                    } else {
                        self.binary.clone()
                    },
                }
            } else {
                RuntimeError::Io {
                    command: self.describe(args),
                    source: e,
                }
            }
        })
    }

    /// Run and require a clean exit.
    fn run(&self, args: &[String], timeout: Duration) -> Result<String, RuntimeError> {
        let output = self.run_raw(args, None, ExecLimits::new(timeout, STATUS_OUTPUT_CAP))?;
        match output.exit {
            super::ExitState::TimedOut => Err(RuntimeError::Timeout {
                command: self.describe(args),
            }),
            exit if exit.success() => Ok(output.stdout_lossy()),
            exit => Err(RuntimeError::Command {
                command: self.describe(args),
                exit,
                stderr: output.stderr_lossy().trim().to_string(),
            }),
        }
    }
}

/// `lxc list` takes a regex filter; anchor it so `pg-a` never matches `pg-ab`.
fn list_args(unit: &str, columns: &str) -> Vec<String> {
    vec![
        "list".to_string(),
        format!("^{}$", unit),
        "--format".to_string(),
        "csv".to_string(),
        "-c".to_string(),
        columns.to_string(),
    ]
}

fn launch_args(unit: &str, profile: &LaunchProfile) -> Vec<String> {
    let mut args = vec![
        "launch".to_string(),
        profile.template.clone(),
        unit.to_string(),
    ];
    for (key, value) in profile.config_entries() {
        args.push("-c".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

fn exec_args(unit: &str, argv: &[String], cwd: Option<&str>) -> Vec<String> {
    let mut args = vec!["exec".to_string(), unit.to_string()];
    if let Some(dir) = cwd {
        args.push("--cwd".to_string());
        args.push(dir.to_string());
    }
    args.push("--".to_string());
    args.extend(argv.iter().cloned());
    args
}

/// Parse `name,STATE` csv rows for exactly `unit`.
fn parse_state(output: &str, unit: &str) -> UnitState {
    output
        .lines()
        .filter_map(|line| line.split_once(','))
        .find(|(name, _)| *name == unit)
        .map(|(_, state)| {
            if state.trim().eq_ignore_ascii_case("running") {
                UnitState::Running
            } else {
                UnitState::Stopped
            }
        })
        .unwrap_or(UnitState::Missing)
}

/// Parse the IPv4 column, e.g. `10.1.2.3 (eth0)`; multiple addresses are
/// newline separated inside one quoted cell.
fn parse_address(output: &str) -> Option<Ipv4Addr> {
    output
        .split(|c: char| c.is_whitespace() || c == '"' || c == ',')
        .find_map(|token| token.parse::<Ipv4Addr>().ok())
}

impl Runtime for LxcRuntime {
    fn state(&self, unit: &str) -> Result<UnitState, RuntimeError> {
        let out = self.run(&list_args(unit, "ns"), self.status_timeout)?;
        Ok(parse_state(&out, unit))
    }

    fn start(&self, unit: &str) -> Result<(), RuntimeError> {
        self.run(&["start".to_string(), unit.to_string()], self.op_timeout)?;
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<(), RuntimeError> {
        let args = ["stop".to_string(), unit.to_string(), "--force".to_string()];
        self.run(&args, self.op_timeout)?;
        Ok(())
    }

    fn delete(&self, unit: &str) -> Result<(), RuntimeError> {
        let args = ["delete".to_string(), unit.to_string(), "--force".to_string()];
        self.run(&args, self.op_timeout)?;
        Ok(())
    }

    fn launch(&self, unit: &str, profile: &LaunchProfile) -> Result<(), RuntimeError> {
        self.run(&launch_args(unit, profile), self.op_timeout)?;
        Ok(())
    }

    fn exec(&self, unit: &str, spec: &ExecSpec<'_>) -> Result<ProcessOutput, RuntimeError> {
        self.run_raw(&exec_args(unit, spec.argv, spec.cwd), spec.stdin, spec.limits)
    }

    fn push_file(&self, unit: &str, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let args = [
            "file".to_string(),
            "push".to_string(),
            local.to_string_lossy().into_owned(),
            format!("{}{}", unit, remote),
            "--create-dirs".to_string(),
        ];
        self.run(&args, self.op_timeout)?;
        Ok(())
    }

    fn pull_file(&self, unit: &str, remote: &str, local: &Path) -> Result<(), RuntimeError> {
        let args = [
            "file".to_string(),
            "pull".to_string(),
            format!("{}{}", unit, remote),
            local.to_string_lossy().into_owned(),
        ];
        self.run(&args, self.op_timeout)?;
        Ok(())
    }

    fn address(&self, unit: &str) -> Result<Option<Ipv4Addr>, RuntimeError> {
        let out = self.run(&list_args(unit, "4"), self.status_timeout)?;
        Ok(parse_address(&out))
    }

    fn probe(&self, template: &str) -> ProbeReport {
        let version = run_with_limits(
            {
                let mut cmd = Command::new(&self.binary);
                cmd.arg("--version");
                cmd
            },
            None,
            ExecLimits::new(self.status_timeout, STATUS_OUTPUT_CAP),
        );
        match version {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProbeReport::failed(
                    ProbeStatus::NotInstalled,
                    format!("'{}' was not found on PATH", self.binary),
                    "Install LXD (e.g. `snap install lxd`) and make sure the lxc client is on PATH",
                );
            }
            Err(e) => {
                return ProbeReport::failed(
                    ProbeStatus::ExecutionFailed,
                    format!("could not run '{} --version': {}", self.binary, e),
                    "Check that the lxc client is executable by the service user",
                );
            }
            Ok(_) => {}
        }

        let list = ["list".to_string(), "--format".to_string(), "csv".to_string()];
        if let Err(e) = self.run(&list, self.status_timeout) {
            return classify_list_failure(&e, self.use_sudo);
        }

        let image_args = ["image".to_string(), "info".to_string(), template.to_string()];
        if let Err(e) = self.run(&image_args, self.status_timeout) {
            return ProbeReport::failed(
                ProbeStatus::TemplateMissing,
                format!("base template '{}' is not available: {}", template, e),
                format!(
                    "Build the template and publish it: `lxc publish <container> --alias {}`",
                    template
                ),
            );
        }

        ProbeReport::ready(format!("{} ready with template '{}'", self.binary, template))
    }
}

fn classify_list_failure(err: &RuntimeError, use_sudo: bool) -> ProbeReport {
    let text = err.to_string().to_lowercase();
    if matches!(err, RuntimeError::NotInstalled { .. }) {
        return ProbeReport::failed(
            ProbeStatus::NotInstalled,
            err.to_string(),
            "Install sudo or disable runtime.use_sudo",
        );
    }
    if use_sudo
        && (text.contains("password is required")
            || text.contains("a terminal is required")
            || text.contains("sudoers"))
    {
        return ProbeReport::failed(
            ProbeStatus::NoPrivilege,
            err.to_string(),
            "Grant passwordless sudo for lxc in /etc/sudoers.d, or run the broker as root",
        );
    }
    if text.contains("permission denied") {
        return ProbeReport::failed(
            ProbeStatus::NoPrivilege,
            err.to_string(),
            "Add the service user to the lxd group or enable runtime.use_sudo",
        );
    }
    if text.contains("lxd init")
        || text.contains("not initialized")
        || text.contains("unix.socket")
        || text.contains("daemon doesn't appear to be started")
    {
        return ProbeReport::failed(
            ProbeStatus::NotInitialized,
            err.to_string(),
            "Initialize the runtime with `lxd init --auto`",
        );
    }
    ProbeReport::failed(
        ProbeStatus::ExecutionFailed,
        err.to_string(),
        "Run `lxc list` manually as the service user to see the full error",
    )
}
