use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::pages;
use crate::sandbox::{AddressResolver, CanonicalId};

/// Removed from the request before it goes upstream.
const REQUEST_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Removed from the upstream response before it goes back.
const RESPONSE_HOP_HEADERS: &[&str] = &["transfer-encoding", "connection", "keep-alive"];

pub const SANDBOX_ID_HEADER: &str = "x-sandbox-id";

/// An incoming request to relay into a sandbox.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path inside the sandbox, starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

/// Relayed (or synthetic) response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set when the proxy produced the response itself.
    pub error: Option<String>,
}

impl ProxyResponse {
    fn synthetic(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.error.is_some()
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        if let Some(error) = &self.error {
            return pages::error_page(self.status, Some(error));
        }
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Clone)]
pub struct SandboxProxy {
    client: reqwest::Client,
    resolver: AddressResolver,
    upstream_port: u16,
}

impl SandboxProxy {
    pub fn new(
        resolver: AddressResolver,
        upstream_port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        // Redirects go back to the browser untouched.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            resolver,
            upstream_port,
        })
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    async fn resolve(&self, id: &CanonicalId) -> Option<Ipv4Addr> {
        let resolver = self.resolver.clone();
        let id = id.clone();
        match tokio::task::spawn_blocking(move || resolver.resolve(&id)).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Address resolution task failed: {}", e);
                None
            }
        }
    }

    async fn send(
        &self,
        id: &CanonicalId,
        req: ProxyRequest,
    ) -> Result<reqwest::Response, ProxyResponse> {
        let Some(addr) = self.resolve(id).await else {
            return Err(ProxyResponse::synthetic(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("sandbox {} has no network address", id),
            ));
        };
        let url = target_url(addr, self.upstream_port, &req.path, req.query.as_deref());
        debug!("Proxying {} {} for {}", req.method, url, id);

        let headers = upstream_headers(&req.headers, id, req.client_ip);
        self.client
            .request(req.method, &url)
            .headers(headers)
            .body(req.body)
            .send()
            .await
            .map_err(|e| {
                warn!("Proxy to {} failed: {}", url, e);
                ProxyResponse::synthetic(StatusCode::BAD_GATEWAY, describe(&e, &url))
            })
    }

    /// Relay one request and buffer the answer. Never fails: transport
    /// errors become 502 and a missing address becomes 503.
    pub async fn forward(&self, id: &CanonicalId, req: ProxyRequest) -> ProxyResponse {
        let upstream = match self.send(id, req).await {
            Ok(resp) => resp,
            Err(synthetic) => return synthetic,
        };
        let status = upstream.status();
        let headers = downstream_headers(upstream.headers());
        match upstream.bytes().await {
            Ok(body) => ProxyResponse {
                status,
                headers,
                body,
                error: None,
            },
            Err(e) => ProxyResponse::synthetic(
                StatusCode::BAD_GATEWAY,
                format!("sandbox response was cut off: {}", e),
            ),
        }
    }

    /// Relay one request, streaming the upstream body to the caller.
    /// Synthetic failures render the themed error page.
    pub async fn forward_streaming(&self, id: &CanonicalId, req: ProxyRequest) -> Response {
        let upstream = match self.send(id, req).await {
            Ok(resp) => resp,
            Err(synthetic) => return synthetic.into_response(),
        };
        let status = upstream.status();
        let headers = downstream_headers(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

pub fn target_url(addr: Ipv4Addr, port: u16, path: &str, query: Option<&str>) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("http://{}:{}{}?{}", addr, port, path, q),
        None => format!("http://{}:{}{}", addr, port, path),
    }
}

fn upstream_headers(
    incoming: &HeaderMap,
    id: &CanonicalId,
    client_ip: Option<IpAddr>,
) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in REQUEST_HOP_HEADERS {
        headers.remove(*name);
    }
    // Headers listed in Connection are hop-by-hop too.
    if let Some(listed) = incoming
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
    {
        for name in listed.split(',') {
            headers.remove(name.trim());
        }
    }

    let prior = incoming
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let forwarded_for = match (prior, client_ip) {
        (Some(prior), Some(ip)) => Some(format!("{}, {}", prior, ip)),
        (Some(prior), None) => Some(prior.to_string()),
        (None, Some(ip)) => Some(ip.to_string()),
        (None, None) => None,
    };
    if let Some(value) = forwarded_for.and_then(|v| HeaderValue::from_str(&v).ok()) {
        headers.insert("x-forwarded-for", value);
    }
    if let Some(host) = incoming.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    let proto = incoming
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    headers.insert("x-forwarded-proto", proto);
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        headers.insert(SANDBOX_ID_HEADER, value);
    }
    headers
}

fn downstream_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in RESPONSE_HOP_HEADERS {
        headers.remove(*name);
    }
    headers
}

fn describe(err: &reqwest::Error, url: &str) -> String {
    if err.is_timeout() {
        format!("sandbox did not answer in time ({})", url)
    } else if err.is_connect() {
        format!("could not connect to sandbox at {}", url)
    } else {
        format!("request to sandbox failed: {}", err)
    }
}
