//! Subprocess execution with a wall-clock timeout and an output byte cap.

use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for pipe readers after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Limits applied to one subprocess run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    /// Cap on stdout + stderr combined.
    pub max_output: usize,
}

impl ExecLimits {
    pub fn new(timeout: Duration, max_output: usize) -> Self {
        Self {
            timeout,
            max_output,
        }
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitState {
    Exited { code: i32 },
    Signaled { signal: i32 },
    /// Killed because the wall-clock timeout elapsed.
    TimedOut,
    /// Killed because the output cap was exceeded.
    OutputLimit,
}

impl ExitState {
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited { code: 0 })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitState::Exited { code } => Some(*code),
            _ => None,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitState::Exited { code },
            None => ExitState::Signaled {
                signal: status.signal().unwrap_or(0),
            },
        }
    }
}

/// Captured (possibly partial) output of a subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: ExitState,
    /// Output was cut at the byte cap.
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

/// Run `command`, feeding `stdin` if given, and stop it once either limit
/// triggers. Partial output is returned in every case.
pub fn run_with_limits(
    mut command: Command,
    stdin: Option<&[u8]>,
    limits: ExecLimits,
) -> io::Result<ProcessOutput> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let data = data.to_vec();
        thread::spawn(move || {
            // EPIPE here just means the child stopped reading.
            let _ = pipe.write_all(&data);
        });
    }

    let total = Arc::new(AtomicUsize::new(0));
    let over = Arc::new(AtomicBool::new(false));
    let out = spawn_capture(child.stdout.take(), &total, &over, limits.max_output);
    let err = spawn_capture(child.stderr.take(), &total, &over, limits.max_output);

    let exit = wait_with_limits(&mut child, &over, limits.timeout)?;

    let grace = Instant::now() + DRAIN_GRACE;
    for capture in [&out, &err].into_iter().flatten() {
        while !capture.handle.is_finished() && Instant::now() < grace {
            thread::sleep(Duration::from_millis(5));
        }
    }

    Ok(ProcessOutput {
        stdout: take_buf(out),
        stderr: take_buf(err),
        exit,
        truncated: over.load(Ordering::SeqCst),
    })
}

fn wait_with_limits(
    child: &mut Child,
    over: &AtomicBool,
    timeout: Duration,
) -> io::Result<ExitState> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ExitState::from_status(status));
        }
        if over.load(Ordering::SeqCst) {
            terminate(child);
            return Ok(ExitState::OutputLimit);
        }
        if Instant::now() >= deadline {
            terminate(child);
            return Ok(ExitState::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("kill after limit failed: {}", e);
    }
    let _ = child.wait();
}

fn spawn_capture<R: Read + Send + 'static>(
    pipe: Option<R>,
    total: &Arc<AtomicUsize>,
    over: &Arc<AtomicBool>,
    cap: usize,
) -> Option<Capture> {
    let mut pipe = pipe?;
    let buf = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&buf);
    let total = Arc::clone(total);
    let over = Arc::clone(over);

    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            let n = match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let before = total.fetch_add(n, Ordering::SeqCst);
            let room = cap.saturating_sub(before);
            if let Ok(mut buf) = shared.lock() {
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
            if before + n > cap {
                over.store(true, Ordering::SeqCst);
                break;
            }
        }
    });

    Some(Capture { buf, handle })
}

fn take_buf(capture: Option<Capture>) -> Vec<u8> {
    capture
        .and_then(|c| c.buf.lock().ok().map(|b| b.clone()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_captures_output_and_exit_code() {
        let out = run_with_limits(
            sh("echo hello; echo oops >&2; exit 3"),
            None,
            ExecLimits::new(Duration::from_secs(5), 1024),
        )
        .unwrap();
        assert_eq!(out.stdout_lossy(), "hello\n");
        assert_eq!(out.stderr_lossy(), "oops\n");
        assert_eq!(out.exit, ExitState::Exited { code: 3 });
        assert!(!out.truncated);
    }

    #[test]
    fn test_timeout_kills_and_keeps_partial_output() {
        let started = Instant::now();
        let out = run_with_limits(
            sh("echo started; sleep 10"),
            None,
            ExecLimits::new(Duration::from_millis(300), 1024),
        )
        .unwrap();
        assert_eq!(out.exit, ExitState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(out.stdout_lossy().contains("started"));
    }

    #[test]
    fn test_output_cap_kills_process() {
        let out = run_with_limits(
            sh("while true; do echo aaaaaaaaaaaaaaaa; done"),
            None,
            ExecLimits::new(Duration::from_secs(10), 4096),
        )
        .unwrap();
        assert_eq!(out.exit, ExitState::OutputLimit);
        assert!(out.truncated);
        assert!(out.stdout.len() <= 4096);
    }

    #[test]
    fn test_stdin_is_forwarded() {
        let out = run_with_limits(
            Command::new("cat"),
            Some(b"piped bytes"),
            ExecLimits::new(Duration::from_secs(5), 1024),
        )
        .unwrap();
        assert_eq!(out.stdout, b"piped bytes");
        assert!(out.exit.success());
    }

    #[test]
    fn test_missing_binary_is_an_io_error() {
        let err = run_with_limits(
            Command::new("definitely-not-a-real-binary-xyz"),
            None,
            ExecLimits::new(Duration::from_secs(1), 16),
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
