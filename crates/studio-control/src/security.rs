use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn json_error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        axum::Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Missing Origin means a non-browser client (the desktop shell, curl).
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };

    allowed.iter().any(|a| a == origin)
}

// Middleware: Origin allowlist on every route, including the event
// WebSocket, so a page in a regular browser cannot drive the studio.
pub async fn origin_guard(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if !origin_is_allowed(req.headers(), &state.allowed_origins) {
        tracing::warn!(
            origin = ?req.headers().get(axum::http::header::ORIGIN),
            path = %req.uri().path(),
            "rejected request from foreign origin"
        );
        return json_error(StatusCode::FORBIDDEN, "origin not allowed");
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn allowed() -> Vec<String> {
        vec![
            "http://localhost:5173".to_string(),
            "http://127.0.0.1:5173".to_string(),
        ]
    }

    #[test]
    fn missing_origin_is_allowed() {
        assert!(origin_is_allowed(&HeaderMap::new(), &allowed()));
    }

    #[test]
    fn listed_origin_is_allowed() {
        let mut h = HeaderMap::new();
        h.insert(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("http://127.0.0.1:5173"),
        );
        assert!(origin_is_allowed(&h, &allowed()));
    }

    #[test]
    fn foreign_origin_is_rejected() {
        let mut h = HeaderMap::new();
        h.insert(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("https://evil.example"),
        );
        assert!(!origin_is_allowed(&h, &allowed()));
        assert!(!origin_is_allowed(&h, &[]));
    }

    #[test]
    fn non_ascii_origin_is_rejected() {
        let mut h = HeaderMap::new();
        h.insert(
            axum::http::header::ORIGIN,
            HeaderValue::from_bytes(b"http://\xffbad").unwrap(),
        );
        assert!(!origin_is_allowed(&h, &allowed()));
    }
}
