//! Caller identity from trusted front-end headers.

use std::convert::Infallible;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::sandbox::CallerContext;

pub const USER_HEADER: &str = "x-playground-user";
pub const PUBLIC_ID_HEADER: &str = "x-playground-public-id";
pub const ADMIN_HEADER: &str = "x-playground-admin";
pub const FORCE_SANDBOX_HEADER: &str = "x-playground-force-sandbox";
pub const SESSION_SANDBOX_HEADER: &str = "x-playground-session-sandbox";

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(
        text(headers, name).map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}

/// Build the caller context. Unparseable values are treated as absent.
pub fn caller_from_headers(headers: &HeaderMap) -> CallerContext {
    CallerContext {
        user_id: text(headers, USER_HEADER).and_then(|v| v.parse().ok()),
        public_id: text(headers, PUBLIC_ID_HEADER).map(str::to_string),
        is_admin: flag(headers, ADMIN_HEADER),
        force_sandbox: flag(headers, FORCE_SANDBOX_HEADER),
        session_sandbox: text(headers, SESSION_SANDBOX_HEADER).map(str::to_string),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(caller_from_headers(&parts.headers))
    }
}
