//! Themed HTML error pages shown to browsers.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

fn title_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::FORBIDDEN => "This sandbox isn't yours",
        StatusCode::NOT_FOUND => "Sandbox not found",
        StatusCode::BAD_GATEWAY => "Sandbox not responding",
        StatusCode::SERVICE_UNAVAILABLE => "Sandbox is starting",
        _ => "Something went wrong",
    }
}

fn hint_for(status: StatusCode) -> &'static str {
    match status {
        StatusCode::FORBIDDEN => {
            "Open the playground from your own account to reach your sandbox."
        }
        StatusCode::NOT_FOUND => {
            "The sandbox may have been removed. Open the playground again to get a new one."
        }
        StatusCode::BAD_GATEWAY => {
            "Nothing is listening inside the sandbox yet. Start your app and reload."
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            "The sandbox has no network address yet. Wait a few seconds and reload."
        }
        _ => "Reload the page or try again later.",
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the page body for `status` with an optional technical detail.
pub fn render(status: StatusCode, detail: Option<&str>) -> String {
    let detail = detail
        .map(|d| format!("<pre class=\"detail\">{}</pre>", escape(d)))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{code} · {title}</title>
<style>
  body {{ margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center;
         background: #0f172a; color: #e2e8f0; font-family: system-ui, -apple-system, sans-serif; }}
  main {{ max-width: 32rem; padding: 2.5rem; border-radius: 1rem; background: #1e293b;
         box-shadow: 0 10px 30px rgba(0, 0, 0, .35); }}
  .code {{ font-size: .875rem; letter-spacing: .1em; color: #38bdf8; }}
  h1 {{ margin: .5rem 0 1rem; font-size: 1.5rem; }}
  p {{ line-height: 1.5; color: #94a3b8; }}
  .detail {{ white-space: pre-wrap; font-size: .8rem; padding: .75rem; border-radius: .5rem;
            background: #0f172a; color: #fca5a5; }}
</style>
</head>
<body>
<main>
  <div class="code">ERROR {code}</div>
  <h1>{title}</h1>
  <p>{hint}</p>
  {detail}
</main>
</body>
</html>
"#,
        code = status.as_u16(),
        title = title_for(status),
        hint = hint_for(status),
        detail = detail,
    )
}

/// A complete HTML error response.
pub fn error_page(status: StatusCode, detail: Option<&str>) -> Response {
    let mut response = (status, render(status, detail)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_are_themed_and_escaped() {
        let html = render(StatusCode::BAD_GATEWAY, Some("<script>alert(1)</script>"));
        assert!(html.contains("ERROR 502"));
        assert!(html.contains("Sandbox not responding"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));

        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(render(status, None).contains(title_for(status)));
        }
    }

    #[test]
    fn test_error_page_headers() {
        let response = error_page(StatusCode::FORBIDDEN, None);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
