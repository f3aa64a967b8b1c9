//! Error classification (C1): maps transport errors, HTTP status codes and
//! decoded upstream error bodies to a retry/rotate decision.
//!
//! Mirrors the rotation logic in [`crate::load_balancer`] — this module only
//! decides *what kind* of failure occurred; the load balancer decides what
//! to do with a key once it knows.

use serde::Serialize;

/// Closed set of error categories the gateway can classify a failure into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    AuthFailure,
    QuotaExceeded,
    Timeout,
    Network,
    Upstream,
    InvalidRequest,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Upstream => "upstream",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// The outcome of classifying a single failed attempt.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub should_rotate_key: bool,
    pub message: String,
}

impl Classification {
    fn new(kind: ErrorKind, retryable: bool, should_rotate_key: bool, message: String) -> Self {
        Self {
            kind,
            retryable,
            should_rotate_key,
            message,
        }
    }
}

/// Classify a transport-level failure (connection never produced a response).
///
/// Rule order matters: the first substring match wins, per the specification.
pub fn classify_transport_error(message: &str) -> Classification {
    let lower = message.to_lowercase();
    if contains_any(&lower, &["timeout", "timed out", "etimedout"]) {
        return Classification::new(ErrorKind::Timeout, true, false, message.to_string());
    }
    if contains_any(
        &lower,
        &["econnrefused", "enotfound", "network", "socket", "fetch failed"],
    ) {
        return Classification::new(ErrorKind::Network, true, false, message.to_string());
    }
    Classification::new(ErrorKind::Unknown, true, false, message.to_string())
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify an HTTP response by status code plus an optional decoded body.
///
/// `body` is the raw response bytes (may be empty, non-JSON, or any of the
/// three supported error-body shapes); the message extracted from it, if
/// any, replaces the generic status-based message.
pub fn classify_http_response(status: u16, body: &[u8]) -> Classification {
    let extracted = extract_error_message(body);

    let (kind, retryable, rotate) = match status {
        401 | 403 => (ErrorKind::AuthFailure, false, true),
        429 => (ErrorKind::RateLimit, true, true),
        402 => (ErrorKind::QuotaExceeded, false, true),
        400 | 404 => (ErrorKind::InvalidRequest, false, false),
        500..=599 => (ErrorKind::Upstream, true, false),
        _ => (ErrorKind::InvalidRequest, false, false),
    };

    let message = extracted.unwrap_or_else(|| format!("upstream returned HTTP {}", status));
    Classification::new(kind, retryable, rotate, message)
}

/// Extract a human message from one of the three supported error-body shapes,
/// tried in order:
///
/// 1. `{"error": {"message": "...", "code"|"type": "..."}}`
/// 2. `{"type": "error", "error": {"message": "...", "type": "..."}}`
/// 3. `{"message": "...", "code"?: "..."}`
/// 4. a bare JSON string.
pub fn extract_error_message(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    if let Some(msg) = value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
    {
        return Some(msg.to_string());
    }
    if value.get("type").and_then(|t| t.as_str()) == Some("error") {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Some(msg.to_string());
        }
    }
    if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
        return Some(msg.to_string());
    }
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    None
}
