//! HTTP API for sandbox management and the sandbox proxy

pub mod caller;
pub mod handlers;
pub mod models;

use std::net::SocketAddr;

use axum::{
    extract::DefaultBodyLimit,
    routing::{any, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app::SharedApp;

/// Create the API router
pub fn create_router(app: SharedApp) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(app.config.proxy.max_body_bytes);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/probe", get(handlers::probe))
        .route("/api/sandboxes", post(handlers::create_sandbox))
        .route(
            "/api/sandboxes/:id",
            get(handlers::get_sandbox).delete(handlers::delete_sandbox),
        )
        .route("/api/sandboxes/:id/exec", post(handlers::exec))
        .route(
            "/api/sandboxes/:id/files",
            get(handlers::list_files).post(handlers::file_operation),
        )
        .route(
            "/api/sandboxes/:id/file",
            get(handlers::read_file).put(handlers::write_file),
        )
        .route("/sandbox/:id", any(handlers::proxy))
        .route("/sandbox/:id/*path", any(handlers::proxy))
        .layer(body_limit)
        .layer(cors)
        .with_state(app)
}

/// Start the API server
pub async fn start_server(app: SharedApp) -> anyhow::Result<()> {
    let addr: SocketAddr = app.config.proxy.listen.parse()?;
    let router = create_router(app);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
