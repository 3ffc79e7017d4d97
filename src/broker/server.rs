//! Privileged side of the broker protocol.
//!
//! Runs as root next to the container tool. Each connection carries exactly
//! one request line and receives exactly one response line.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::protocol::{
    to_line, BrokerRequest, BrokerResponse, ErrorCode, ACTION_CREATE, ACTION_EXEC,
};
use crate::runtime::process::run_with_limits;
use crate::runtime::{DriverError, ExecLimits, RuntimeError, SandboxDriver};
use crate::sandbox::CanonicalId;
use crate::security;

/// Requests longer than this are refused without parsing.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

type CreateResult = watch::Receiver<Option<BrokerResponse>>;

/// What the broker needs to act on requests.
pub struct BrokerContext {
    pub driver: Arc<SandboxDriver>,
    /// Per-sandbox operation logs land in `<log_dir>/<id>.log`.
    pub log_dir: PathBuf,
    /// Run after provisioning with the canonical id and host path.
    pub create_helper: Option<PathBuf>,
    pub helper_limits: ExecLimits,
    pub exec_limits: ExecLimits,
    /// Creates still running, keyed by id. Later requests share the result.
    creating: Mutex<HashMap<CanonicalId, CreateResult>>,
}

impl BrokerContext {
    pub fn new(
        driver: Arc<SandboxDriver>,
        log_dir: PathBuf,
        create_helper: Option<PathBuf>,
        helper_limits: ExecLimits,
        exec_limits: ExecLimits,
    ) -> Self {
        Self {
            driver,
            log_dir,
            create_helper,
            helper_limits,
            exec_limits,
            creating: Mutex::new(HashMap::new()),
        }
    }

    fn creating(&self) -> MutexGuard<'_, HashMap<CanonicalId, CreateResult>> {
        self.creating.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_path(&self, id: &CanonicalId) -> PathBuf {
        self.log_dir.join(format!("{}.log", id))
    }

    /// Append a line to the sandbox log. Failures are only traced.
    fn append_log(&self, id: &CanonicalId, line: &str) {
        let path = self.log_path(id);
        let result = fs::create_dir_all(&self.log_dir).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(
                file,
                "[{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                line
            )
        });
        if let Err(e) = result {
            warn!("Could not write broker log {:?}: {}", path, e);
        }
    }
}

pub struct BrokerServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    ctx: Arc<BrokerContext>,
    read_timeout: Duration,
}

impl BrokerServer {
    /// Bind the socket, replacing a stale one, and apply `mode`.
    pub fn bind(socket_path: PathBuf, mode: u32, ctx: BrokerContext) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {:?}", parent))?;
        }
        if socket_path.exists() {
            fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {:?}", socket_path))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding broker socket {:?}", socket_path))?;
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&socket_path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("setting permissions on {:?}", socket_path))?;
        }

        info!("Broker listening on {:?} (mode {:o})", socket_path, mode);
        Ok(Self {
            socket_path,
            listener: Some(listener),
            ctx: Arc::new(ctx),
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// How long a client may take to send its request line.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the listener fails.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("broker already running"))?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, ctx, read_timeout).await {
                            warn!("Broker connection failed: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Error accepting broker connection: {}", e),
            }
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = fs::remove_file(&self.socket_path) {
                warn!("Failed to remove broker socket: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    ctx: Arc<BrokerContext>,
    read_timeout: Duration,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    let read = tokio::time::timeout(read_timeout, reader.read_line(&mut line)).await;
    let response = match read {
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => match serde_json::from_str::<BrokerRequest>(line.trim()) {
            Ok(request) => dispatch(request, ctx).await,
            Err(e) => {
                debug!("Malformed broker request: {}", e);
                let message = format!("malformed request: {}", e);
                BrokerResponse::failure(ErrorCode::BadRequest, message)
            }
        },
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            debug!("No broker request within {:?}", read_timeout);
            BrokerResponse::failure(ErrorCode::BadRequest, "request not received in time")
        }
    };

    writer.write_all(to_line(&response)?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Validate and route one request.
pub async fn dispatch(request: BrokerRequest, ctx: Arc<BrokerContext>) -> BrokerResponse {
    let Some(id) = CanonicalId::parse(&request.sandbox_id) else {
        warn!(
            "Rejecting non-canonical sandbox id {:?} (original {:?})",
            request.sandbox_id, request.original_sandbox_id
        );
        return BrokerResponse::failure(
            ErrorCode::InvalidSandboxId,
            "sandboxId must already be canonical",
        );
    };

    match request.action.as_str() {
        ACTION_CREATE => create_once(ctx, id, request).await,
        ACTION_EXEC => handle_exec(ctx, id, request),
        other => BrokerResponse::failure(
            ErrorCode::UnknownAction,
            format!("unknown action '{}'", other),
        ),
    }
}

/// Run at most one create per id. Requests arriving while one is in flight
/// wait for it and receive the same response.
async fn create_once(
    ctx: Arc<BrokerContext>,
    id: CanonicalId,
    request: BrokerRequest,
) -> BrokerResponse {
    let mut result = {
        let mut creating = ctx.creating();
        let existing = creating.get(&id).cloned();
        match existing {
            Some(pending) => {
                info!("Create for {} already in progress, waiting for it", id);
                pending
            }
            None => {
                let (done, pending) = watch::channel(None);
                creating.insert(id.clone(), pending.clone());
                let worker = Arc::clone(&ctx);
                let unit_id = id.clone();
                tokio::task::spawn_blocking(move || {
                    let slot = CreateSlot {
                        ctx: &worker,
                        id: &unit_id,
                    };
                    let response = handle_create(&worker, &unit_id, &request);
                    drop(slot);
                    let _ = done.send(Some(response));
                });
                pending
            }
        }
    };

    let response = match result.wait_for(Option::is_some).await {
        Ok(response) => (*response).clone().unwrap_or_default(),
        Err(_) => {
            error!("Broker create task for {} ended without a response", id);
            BrokerResponse::failure(ErrorCode::Internal, "create task failed")
        }
    };
    response
}

/// Frees the in-flight entry when the create finishes, even by panic.
struct CreateSlot<'a> {
    ctx: &'a BrokerContext,
    id: &'a CanonicalId,
}

impl Drop for CreateSlot<'_> {
    fn drop(&mut self) {
        self.ctx.creating().remove(self.id);
    }
}

fn handle_create(
    ctx: &BrokerContext,
    id: &CanonicalId,
    request: &BrokerRequest,
) -> BrokerResponse {
    info!(
        "Broker create for {} (original {:?})",
        id, request.original_sandbox_id
    );
    ctx.append_log(
        id,
        &format!("create requested (original id {:?})", request.original_sandbox_id),
    );

    if let Some(host_path) = request.host_path.as_deref() {
        if !is_clean_absolute(host_path) {
            return BrokerResponse::failure(
                ErrorCode::BadRequest,
                "hostPath must be absolute and free of '..'",
            );
        }
    }

    match ctx.driver.create(id) {
        Ok(true) => ctx.append_log(id, "unit launched"),
        Ok(false) => ctx.append_log(id, "unit already existed"),
        Err(e) => {
            let code = classify_create_failure(&e);
            error!("Broker create for {} failed ({}): {}", id, code.as_str(), e);
            ctx.append_log(id, &format!("create failed ({}): {}", code.as_str(), e));
            return BrokerResponse::failure(code, e.to_string());
        }
    }

    if let Some(helper) = &ctx.create_helper {
        if let Err(response) = run_helper(ctx, helper, id, request.host_path.as_deref()) {
            return response;
        }
    }

    BrokerResponse::success(id.as_str(), Some(ctx.log_path(id).display().to_string()))
}

fn run_helper(
    ctx: &BrokerContext,
    helper: &Path,
    id: &CanonicalId,
    host_path: Option<&str>,
) -> Result<(), BrokerResponse> {
    if !helper.is_file() {
        let message = format!("create helper {} is missing", helper.display());
        error!("{}", message);
        ctx.append_log(id, &message);
        return Err(BrokerResponse::failure(ErrorCode::HelperMissing, message));
    }

    let mut cmd = Command::new(helper);
    cmd.arg(id.as_str());
    if let Some(path) = host_path {
        cmd.arg(path);
    }
    match run_with_limits(cmd, None, ctx.helper_limits) {
        Ok(out) if out.exit.success() => {
            ctx.append_log(id, "create helper finished");
            Ok(())
        }
        Ok(out) => {
            let message = format!(
                "create helper exited with {:?}: {}",
                out.exit,
                out.stderr_lossy().trim()
            );
            error!("{} for {}", message, id);
            ctx.append_log(id, &message);
            Err(BrokerResponse::failure(ErrorCode::CreateFailed, message))
        }
        Err(e) => {
            let message = format!("could not run create helper: {}", e);
            error!("{} for {}", message, id);
            ctx.append_log(id, &message);
            Err(BrokerResponse::failure(ErrorCode::CreateFailed, message))
        }
    }
}

/// Filter, acknowledge, and run the command in the background.
fn handle_exec(
    ctx: Arc<BrokerContext>,
    id: CanonicalId,
    request: BrokerRequest,
) -> BrokerResponse {
    let Some(command) = request.command.filter(|c| !c.trim().is_empty()) else {
        return BrokerResponse::failure(ErrorCode::BadRequest, "exec requires a command");
    };

    let verdict = security::evaluate(&command);
    if !verdict.allowed {
        let reason = verdict.reason.unwrap_or_else(|| "command denied".to_string());
        warn!("Broker refused command for {}: {}", id, reason);
        ctx.append_log(&id, &format!("exec denied: {}", reason));
        return BrokerResponse::failure(ErrorCode::CommandDenied, reason);
    }

    let log = ctx.log_path(&id).display().to_string();
    ctx.append_log(&id, &format!("exec accepted: {}", command));
    let cwd = request.cwd;
    let ack_id = id.to_string();
    tokio::task::spawn_blocking(move || {
        match ctx.driver.exec(&id, &command, cwd.as_deref(), ctx.exec_limits) {
            Ok(out) => {
                ctx.append_log(
                    &id,
                    &format!(
                        "exec finished {:?}{}\n--- stdout ---\n{}\n--- stderr ---\n{}",
                        out.exit,
                        if out.truncated { " (truncated)" } else { "" },
                        out.stdout_lossy(),
                        out.stderr_lossy()
                    ),
                );
            }
            Err(e) => {
                warn!("Background exec in {} failed: {}", id, e);
                ctx.append_log(&id, &format!("exec failed: {}", e));
            }
        }
    });
    BrokerResponse::success(&ack_id, Some(log))
}

fn classify_create_failure(err: &DriverError) -> ErrorCode {
    let text = match err {
        DriverError::Runtime(RuntimeError::NotInstalled { binary }) if binary == "sudo" => {
            return ErrorCode::SudoUnavailable
        }
        DriverError::Runtime(RuntimeError::Command { stderr, .. }) => stderr.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    if text.contains("sudo")
        && (text.contains("password is required")
            || text.contains("a terminal is required")
            || text.contains("not allowed")
            || text.contains("sudoers"))
    {
        ErrorCode::SudoUnavailable
    } else {
        ErrorCode::CreateFailed
    }
}

fn is_clean_absolute(path: &str) -> bool {
    path.starts_with('/') && !path.contains('\0') && !path.split('/').any(|s| s == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::{ExitState, LaunchProfile, UnitState};
    use crate::sandbox::{NamingScheme, UnitNamer};
    use std::time::Duration;

    fn context(
        runtime: Arc<FakeRuntime>,
        log_dir: &Path,
        helper: Option<PathBuf>,
    ) -> BrokerContext {
        let driver = SandboxDriver::new(
            runtime,
            UnitNamer::new("pg-", NamingScheme::Canonical),
            LaunchProfile {
                template: "base".to_string(),
                cpu: "1".to_string(),
                memory: "512MB".to_string(),
                processes: 128,
                nesting: false,
                syscall_intercepts: Vec::new(),
            },
            "/srv/sandbox",
        )
        .with_timing(Duration::ZERO, Duration::from_millis(20));
        BrokerContext::new(
            Arc::new(driver),
            log_dir.to_path_buf(),
            helper,
            ExecLimits::new(Duration::from_secs(5), 4096),
            ExecLimits::new(Duration::from_secs(5), 4096),
        )
    }

    fn request(json: &str) -> BrokerRequest {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_create_launches_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = Arc::new(context(runtime.clone(), dir.path(), None));

        let resp = dispatch(
            request(r#"{"action":"create","sandboxId":"u42","originalSandboxId":"U42"}"#),
            ctx,
        )
        .await;
        assert!(resp.ok);
        assert_eq!(resp.sandbox_id.as_deref(), Some("u42"));
        assert_eq!(runtime.state_of("pg-u42"), UnitState::Running);

        let log = fs::read_to_string(dir.path().join("u42.log")).unwrap();
        assert!(log.contains("original id \"U42\""));
        assert!(log.contains("unit launched"));
    }

    #[tokio::test]
    async fn test_rejects_non_canonical_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context(Arc::new(FakeRuntime::new()), dir.path(), None));

        let resp = dispatch(
            request(r#"{"action":"create","sandboxId":"../Etc"}"#),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("invalid_sandbox_id"));

        let resp = dispatch(request(r#"{"action":"destroy","sandboxId":"abc"}"#), ctx).await;
        assert_eq!(resp.error.as_deref(), Some("unknown_action"));
    }

    #[tokio::test]
    async fn test_missing_helper_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("missing-helper.sh");
        let ctx = Arc::new(context(Arc::new(FakeRuntime::new()), dir.path(), Some(helper)));
        let resp = dispatch(request(r#"{"action":"create","sandboxId":"abc"}"#), ctx).await;
        assert_eq!(resp.error.as_deref(), Some("helper_missing"));
        let log = fs::read_to_string(dir.path().join("abc.log")).unwrap();
        assert!(log.contains("missing"));
    }

    #[tokio::test]
    async fn test_bad_host_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(context(Arc::new(FakeRuntime::new()), dir.path(), None));
        let resp = dispatch(
            request(r#"{"action":"create","sandboxId":"abc","hostPath":"/srv/../etc"}"#),
            ctx,
        )
        .await;
        assert_eq!(resp.error.as_deref(), Some("bad_request"));
    }

    #[tokio::test]
    async fn test_exec_is_filtered_then_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_unit("pg-abc", UnitState::Running));
        let ctx = Arc::new(context(runtime.clone(), dir.path(), None));

        let denied = dispatch(
            request(r#"{"action":"exec","sandboxId":"abc","command":"sudo reboot"}"#),
            Arc::clone(&ctx),
        )
        .await;
        assert_eq!(denied.error.as_deref(), Some("command_denied"));
        assert!(runtime.exec_argvs().is_empty());

        let ack = dispatch(
            request(r#"{"action":"exec","sandboxId":"abc","command":"echo hi","cwd":"app"}"#),
            ctx,
        )
        .await;
        assert!(ack.ok);
        assert!(ack.log.unwrap().ends_with("abc.log"));

        // The command runs after the acknowledgement.
        for _ in 0..100 {
            if !runtime.exec_argvs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            runtime.exec_argvs()[0],
            vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn test_classify_sudo() {
        let err = DriverError::Runtime(RuntimeError::Command {
            command: "sudo -n lxc launch".to_string(),
            exit: ExitState::Exited { code: 1 },
            stderr: "sudo: a password is required".to_string(),
        });
        assert_eq!(classify_create_failure(&err), ErrorCode::SudoUnavailable);
        let err = DriverError::Failed {
            op: "mkdir",
            stderr: "disk full".to_string(),
        };
        assert_eq!(classify_create_failure(&err), ErrorCode::CreateFailed);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let ctx = context(Arc::new(FakeRuntime::new()), dir.path(), None);
        let mut server = BrokerServer::bind(socket.clone(), 0o660, ctx).unwrap();
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(&socket).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode, 0o660);
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(b"not json\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        assert!(line.contains("bad_request"));
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let helper = dir.path().join("after-create.sh");
        fs::write(
            &helper,
            format!("#!/bin/sh\necho \"$1\" >> {}\nsleep 0.3\n", runs.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&helper, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = Arc::new(context(runtime.clone(), dir.path(), Some(helper)));
        let create = || {
            dispatch(
                request(r#"{"action":"create","sandboxId":"abc"}"#),
                Arc::clone(&ctx),
            )
        };

        let (a, b, c) = tokio::join!(create(), create(), create());
        assert!(a.ok && b.ok && c.ok);
        assert_eq!(a, b);
        assert_eq!(fs::read_to_string(&runs).unwrap(), "abc\n");
        assert_eq!(runtime.launched.lock().unwrap().len(), 1);
        assert!(ctx.creating().is_empty());

        // Once settled, the next create runs again.
        assert!(create().await.ok);
        assert_eq!(fs::read_to_string(&runs).unwrap(), "abc\nabc\n");
    }

    #[tokio::test]
    async fn test_idle_connection_gets_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let ctx = context(Arc::new(FakeRuntime::new()), dir.path(), None);
        let mut server = BrokerServer::bind(socket.clone(), 0o600, ctx)
            .unwrap()
            .with_read_timeout(Duration::from_millis(100));
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (reader, _writer) = stream.into_split();
        let mut line = String::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            BufReader::new(reader).read_line(&mut line),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(line.contains("bad_request"));
        assert!(line.contains("not received in time"));
    }
}
