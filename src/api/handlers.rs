//! API endpoint handlers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use super::models::*;
use crate::app::SharedApp;
use crate::broker::ErrorCode;
use crate::control::ControlError;
use crate::proxy::{pages, resolve_ownership, ProxyRequest};
use crate::runtime::{DriverError, ExecLimits, ProbeReport, RuntimeError};
use crate::sandbox::{CallerContext, CanonicalId, Isolation, RegistryError, TeardownReport};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            reason: None,
        }),
    )
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, format!("Task failed: {}", e)))
}

fn driver_error(err: DriverError) -> ApiError {
    let status = match &err {
        DriverError::Path(_) => StatusCode::BAD_REQUEST,
        DriverError::FileNotFound { .. } | DriverError::UnitMissing { .. } => {
            StatusCode::NOT_FOUND
        }
        DriverError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        DriverError::NotRunning { .. }
        | DriverError::Runtime(RuntimeError::NotInstalled { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, err.to_string())
}

fn control_error(err: ControlError) -> ApiError {
    match err {
        ControlError::Denied { reason } => (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "Command denied".to_string(),
                reason: Some(reason),
            }),
        ),
        ControlError::BrokerRequired(e) => error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        ControlError::Broker(crate::broker::BrokerError::Rejected { code, message })
            if code == ErrorCode::CommandDenied.as_str() =>
        {
            (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse {
                    error: "Command denied".to_string(),
                    reason: message,
                }),
            )
        }
        ControlError::Broker(e) => error(StatusCode::BAD_GATEWAY, e.to_string()),
        ControlError::Driver(e) => driver_error(e),
        ControlError::Join(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn registry_error(err: RegistryError) -> ApiError {
    match err {
        RegistryError::NoIdentity => error(StatusCode::UNAUTHORIZED, err.to_string()),
        other => error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// Label used in broker audit logs for the sandbox owner.
fn owner_label(caller: &CallerContext) -> String {
    match (caller.user_id, caller.public_id.as_deref()) {
        (Some(user), _) => format!("user:{}", user),
        (None, Some(public)) => format!("public:{}", public),
        (None, None) => "session".to_string(),
    }
}

/// Parse the id and check the caller owns it.
async fn authorize(
    app: &SharedApp,
    raw: &str,
    caller: &CallerContext,
) -> Result<CanonicalId, ApiError> {
    let id = CanonicalId::parse(raw)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Sandbox '{}' not found", raw)))?;
    let owned = {
        let app = Arc::clone(app);
        let id = id.clone();
        let caller = caller.clone();
        blocking(move || resolve_ownership(&app.registry, &id, &caller)).await?
    };
    if !owned {
        return Err(error(
            StatusCode::FORBIDDEN,
            format!("Sandbox '{}' does not belong to the caller", raw),
        ));
    }
    Ok(id)
}

/// GET /api/health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/probe
pub async fn probe(State(app): State<SharedApp>) -> ApiResult<ProbeReport> {
    let report = blocking(move || app.driver.probe()).await?;
    Ok(Json(report))
}

/// POST /api/sandboxes
pub async fn create_sandbox(
    State(app): State<SharedApp>,
    caller: CallerContext,
    body: Option<Json<CreateSandboxRequest>>,
) -> Result<Response, ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let isolation = {
        let app = Arc::clone(&app);
        let caller = caller.clone();
        blocking(move || app.registry.find_or_create(&caller))
            .await?
            .map_err(registry_error)?
    };
    let id = match isolation {
        Isolation::Unconstrained => return Ok(Json(Isolation::Unconstrained).into_response()),
        Isolation::Sandboxed(id) => id,
    };

    let provisioned = app
        .control
        .provision(&id, &owner_label(&caller), req.host_path.as_deref())
        .await
        .map_err(control_error)?;

    let address = {
        let app = Arc::clone(&app);
        let id = id.clone();
        blocking(move || {
            if let Err(e) = app.registry.mark_provisioned(&id) {
                warn!("Could not mark {} provisioned: {}", id, e);
            }
            app.resolver.resolve(&id)
        })
        .await?
    };
    info!("Sandbox {} ready for {}", id, owner_label(&caller));

    Ok(Json(SandboxResponse {
        sandbox_id: id.to_string(),
        unit: app.driver.unit_name(&id),
        address: address.map(|a| a.to_string()),
        route: Some(provisioned.route),
        created: provisioned.created,
        log: provisioned.log,
    })
    .into_response())
}

/// GET /api/sandboxes/:id
pub async fn get_sandbox(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
) -> ApiResult<SandboxStatusResponse> {
    let id = authorize(&app, &raw, &caller).await?;
    let unit = app.driver.unit_name(&id);
    let (valid, state, address) = {
        let app = Arc::clone(&app);
        let id = id.clone();
        blocking(move || {
            let valid = app.registry.validate(&id);
            let state = app.driver.state(&id).ok();
            let address = if valid { app.resolver.resolve(&id) } else { None };
            (valid, state, address)
        })
        .await?
    };
    if !valid {
        return Err(error(StatusCode::NOT_FOUND, format!("Sandbox '{}' not found", raw)));
    }
    Ok(Json(SandboxStatusResponse {
        sandbox_id: id.to_string(),
        unit,
        state,
        address: address.map(|a| a.to_string()),
    }))
}

/// DELETE /api/sandboxes/:id
pub async fn delete_sandbox(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
) -> Result<(StatusCode, Json<TeardownReport>), ApiError> {
    let id = authorize(&app, &raw, &caller).await?;
    let report = blocking(move || app.registry.teardown(&id)).await?;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(report)))
}

/// POST /api/sandboxes/:id/exec
pub async fn exec(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<ExecResponse> {
    let id = authorize(&app, &raw, &caller).await?;
    let limits = req.timeout_secs.map(|secs| {
        ExecLimits::new(Duration::from_secs(secs), app.config.exec.max_output_bytes)
    });
    let outcome = app
        .control
        .exec(&id, &owner_label(&caller), &req.command, req.cwd.as_deref(), limits)
        .await
        .map_err(control_error)?;
    Ok(Json(outcome))
}

/// GET /api/sandboxes/:id/files
pub async fn list_files(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<ListFilesResponse> {
    let id = authorize(&app, &raw, &caller).await?;
    let path = query.path.clone();
    let entries = blocking(move || app.driver.list_files(&id, &query.path, query.depth))
        .await?
        .map_err(driver_error)?;
    Ok(Json(ListFilesResponse { path, entries }))
}

/// GET /api/sandboxes/:id/file
pub async fn read_file(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<FileContent> {
    let id = authorize(&app, &raw, &caller).await?;
    let path = query.path.clone();
    let data = blocking(move || app.driver.read_file(&id, &query.path))
        .await?
        .map_err(driver_error)?;
    Ok(Json(FileContent {
        path,
        content: STANDARD.encode(data),
    }))
}

/// PUT /api/sandboxes/:id/file
pub async fn write_file(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
    Json(req): Json<FileContent>,
) -> ApiResult<FileOperationResponse> {
    let id = authorize(&app, &raw, &caller).await?;
    let data = STANDARD
        .decode(req.content.as_bytes())
        .map_err(|e| error(StatusCode::BAD_REQUEST, format!("Invalid base64 content: {}", e)))?;
    blocking(move || app.driver.write_file(&id, &req.path, &data))
        .await?
        .map_err(driver_error)?;
    Ok(Json(FileOperationResponse {
        ok: true,
        exists: None,
    }))
}

/// POST /api/sandboxes/:id/files
pub async fn file_operation(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(raw): Path<String>,
    Json(op): Json<FileOperation>,
) -> ApiResult<FileOperationResponse> {
    let id = authorize(&app, &raw, &caller).await?;
    let response = blocking(move || {
        let driver = &app.driver;
        match op {
            FileOperation::Create { path, kind } => {
                driver.create_item(&id, &path, kind).map(|_| None)
            }
            FileOperation::Delete { path } => driver.delete_item(&id, &path).map(|_| None),
            FileOperation::Rename { from, to } => driver.rename_item(&id, &from, &to).map(|_| None),
            FileOperation::Copy { from, to } => driver.copy_item(&id, &from, &to).map(|_| None),
            FileOperation::Exists { path } => driver.path_exists(&id, &path).map(Some),
        }
    })
    .await?
    .map_err(driver_error)?;
    Ok(Json(FileOperationResponse {
        ok: true,
        exists: response,
    }))
}

/// Path inside the sandbox for a `/sandbox/:id/...` request.
fn upstream_path(uri: &Uri, raw_id: &str, captured: Option<&String>) -> String {
    let prefix = format!("/sandbox/{}", raw_id);
    match uri.path().strip_prefix(&prefix) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => format!("/{}", captured.map(String::as_str).unwrap_or("")),
    }
}

/// ANY /sandbox/:id/*path
#[allow(clippy::too_many_arguments)]
pub async fn proxy(
    State(app): State<SharedApp>,
    caller: CallerContext,
    Path(params): Path<HashMap<String, String>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = params.get("id").cloned().unwrap_or_default();
    let id = match authorize(&app, &raw, &caller).await {
        Ok(id) => id,
        Err((status, Json(err))) => return pages::error_page(status, Some(&err.error)),
    };

    let req = ProxyRequest {
        method,
        path: upstream_path(&uri, &raw, params.get("path")),
        query: uri.query().map(str::to_string),
        headers,
        body,
        client_ip: connect.map(|ConnectInfo(addr)| addr.ip()),
    };
    app.proxy.forward_streaming(&id, req).await
}
