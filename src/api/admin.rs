//! Admin/observability surface over the event store (§6.3): record
//! snapshot, live SSE stream, JSON/HAR export, and a free-text analysis
//! endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json},
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::event_store::ProxyRecord;

use super::state::AppState;

pub async fn records(State(state): State<Arc<AppState>>) -> Json<Vec<ProxyRecord>> {
    Json(state.event_store.snapshot().await)
}

pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.event_store.subscribe().await;
    let stream = async_stream::stream! {
        let mut subscription = subscription;
        while let Some(record) = subscription.rx.recv().await {
            if let Ok(event) = Event::default().json_data(&record) {
                yield Ok(event);
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_format")]
    pub format: String,
    pub ids: Option<String>,
}

fn default_format() -> String {
    "json".to_string()
}

pub async fn export(State(state): State<Arc<AppState>>, Query(query): Query<ExportQuery>) -> impl IntoResponse {
    let mut records = state.event_store.snapshot().await;
    if let Some(ids) = query.ids {
        let wanted: Vec<&str> = ids.split(',').collect();
        records.retain(|r| wanted.contains(&r.id.as_str()));
    }

    match query.format.as_str() {
        "har" => Json(to_har(&records)).into_response(),
        _ => Json(records).into_response(),
    }
}

/// Render records as a minimal HAR 1.2 log, with gateway-specific fields
/// kept under a `_xling` extension block per entry.
fn to_har(records: &[ProxyRecord]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            json!({
                "startedDateTime": r.started_at.to_rfc3339(),
                "time": r.duration_ms.unwrap_or(0),
                "request": {
                    "method": r.method,
                    "url": r.path,
                    "headers": headers_to_har(&r.request.headers),
                    "postData": {"mimeType": "application/json", "text": r.request.body_preview},
                },
                "response": {
                    "status": r.status.unwrap_or(0),
                    "content": {
                        "mimeType": "application/json",
                        "text": r.response.as_ref().map(|s| s.body_preview.clone()).unwrap_or_default(),
                    }
                },
                "_xling": {
                    "id": r.id,
                    "model": r.model,
                    "provider": r.provider,
                    "streaming": r.streaming,
                    "retryCount": r.retry_count,
                    "errorType": r.error_type,
                    "errorMessage": r.error_message,
                }
            })
        })
        .collect();

    json!({
        "log": {
            "version": "1.2",
            "creator": {"name": "xling-gateway", "version": env!("CARGO_PKG_VERSION")},
            "entries": entries,
        }
    })
}

fn headers_to_har(headers: &std::collections::BTreeMap<String, String>) -> Vec<serde_json::Value> {
    headers
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub id: String,
    pub prompt: Option<String>,
    pub model: Option<String>,
}

/// Stream a free-text analysis of one record over SSE. There is no
/// built-in summarizer here; this simply echoes a canned breakdown of the
/// selected record's sanitized summary so the endpoint works without a
/// configured completion backend. A future version may route this through a
/// configured provider.
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let record = state.event_store.get(&req.id).await;
    let prompt = req.prompt.unwrap_or_default();
    let stream = async_stream::stream! {
        match record {
            Some(r) => {
                let text = format!(
                    "record {} [{} {}] -> status {:?}, provider {:?}, model {:?}{}: {}",
                    r.id,
                    r.method,
                    r.path,
                    r.status,
                    r.provider,
                    r.model,
                    req.model.map(|m| format!(" (requested model: {})", m)).unwrap_or_default(),
                    prompt
                );
                yield Ok(Event::default().data(json!({"text": text}).to_string()));
            }
            None => {
                yield Ok(Event::default().data(json!({"error": format!("no record with id {}", req.id)}).to_string()));
            }
        }
    };
    Sse::new(stream)
}
