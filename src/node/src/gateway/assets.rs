//! Static browser assets.

use std::path::{Path, PathBuf};

use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::{Body, Response, StatusCode};

const INDEX_FILE: &str = "index.html";

/// Serve `request_path` from `root`.
///
/// Directories resolve to their `index.html`. Paths containing `..` are
/// rejected with 400, anything not found is 404.
pub(super) async fn serve(root: &Path, request_path: &str, head_only: bool) -> Response<Body> {
    let Some(relative) = relative_path(request_path) else {
        return super::text_response(StatusCode::BAD_REQUEST, "invalid URL path");
    };

    let mut target = root.join(relative);
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => target.push(INDEX_FILE),
        Ok(_) => {}
        Err(_) => return not_found(),
    }

    let content = match tokio::fs::read(&target).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
        Err(e) => {
            tracing::warn!(path = %target.display(), error = %e, "Failed to read static file");
            return not_found();
        }
    };

    let length = content.len();
    let body = if head_only { Body::empty() } else { Body::from(content) };
    let mut response = super::with_content_type(StatusCode::OK, content_type(&target), body);
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

fn not_found() -> Response<Body> {
    super::text_response(StatusCode::NOT_FOUND, "404 page not found")
}

/// Request path relative to the asset root, `None` if it tries to escape.
fn relative_path(request_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s if s.contains('\\') => return None,
            s => relative.push(s),
        }
    }
    Some(relative)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("wasm") => "application/wasm",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
