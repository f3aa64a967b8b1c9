//! Gateway access-key auth (§4.6): a single shared secret checked against
//! the `Authorization: Bearer <key>` header, `X-API-Key: <key>`, or an
//! `xling_access=<key>` cookie. No sessions, no users — if `accessKey` isn't
//! configured, the gateway is open.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use super::state::AppState;

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn extract_presented_key(req: &Request<Body>) -> Option<String> {
    if let Some(auth) = req.headers().get(axum::http::header::AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
            return Some(token.to_string());
        }
    }
    if let Some(key) = req.headers().get("x-api-key").and_then(|h| h.to_str().ok()) {
        return Some(key.to_string());
    }
    if let Some(cookie) = req.headers().get(axum::http::header::COOKIE).and_then(|h| h.to_str().ok()) {
        for part in cookie.split(';') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix("xling_access=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"type": "auth_error", "message": "missing or invalid access key"}})),
    )
        .into_response()
}

pub async fn require_access_key(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    let access_key = state.config.load().proxy.access_key.clone();
    let Some(expected) = access_key else {
        return next.run(req).await;
    };

    match extract_presented_key(&req) {
        Some(presented) if constant_time_eq(&presented, &expected) => next.run(req).await,
        _ => unauthorized(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings_only() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
