//! C6 Gateway Server: the proxy request lifecycle — parse, detect dialect,
//! map model, select a provider/key, forward upstream with retry across
//! providers, translate the response back, and record everything in the
//! event store (§4.6).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::classify::{self, Classification};
use crate::config::{Provider, ToolFormat};
use crate::dialect::{self, anthropic, anthropic_stream::AnthropicStreamTranslator, responses, responses_stream::ResponsesStreamTranslator, Dialect};
use crate::event_store::RecordPatch;
use crate::model_router;
use crate::sse::SseTokenizer;

use super::state::AppState;

/// Request headers that must never be forwarded upstream verbatim: either
/// they're hop-by-hop, or they'd leak the client's access key, or they're
/// about to be replaced with the provider's own auth.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "x-api-key",
    "cookie",
    "content-length",
    "connection",
];

pub async fn handle(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Response {
    let id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();

    let body_bytes = match axum::body::to_bytes(req.into_body(), 10 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return bad_request("failed to read request body"),
    };

    let body: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return bad_request("invalid JSON body"),
    };

    let config = state.config.load_full();

    let dialect = dialect::detect(&body);
    let passthrough = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(|m| config.is_passthrough_responses_model(m))
        .unwrap_or(false);
    let normalized_path = dialect::normalize_path(&path, dialect, passthrough);

    let requested_model = body.get("model").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let mapped_model = model_router::map_model(
        &requested_model,
        &config.proxy.model_mapping,
        config.default_model.as_deref(),
        &config.providers,
    )
    .unwrap_or(requested_model.clone());

    let (candidates, effective_model) = model_router::select_providers(&mapped_model, &config.providers);
    let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    state
        .event_store
        .start(
            id.clone(),
            method,
            path.clone(),
            &headers,
            &body_bytes,
            streaming,
            Some(effective_model.clone()),
            None,
        )
        .await;

    if candidates.is_empty() {
        let patch = RecordPatch {
            status: Some(503),
            error_type: Some("no_provider".to_string()),
            error_message: Some("no provider configured for this model".to_string()),
            ..Default::default()
        };
        state.event_store.update(&id, patch).await;
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "no_provider", "no provider configured for this model");
    }

    let mut outbound_body = if dialect == Dialect::Anthropic {
        anthropic::request_to_openai(&body)
    } else if dialect == Dialect::Responses {
        responses::request_to_openai(&body)
    } else {
        body.clone()
    };
    if let Some(obj) = outbound_body.as_object_mut() {
        obj.insert("model".to_string(), json!(effective_model));
    }

    let candidates: Vec<Provider> = candidates.into_iter().cloned().collect();
    let max_attempts = if config.proxy.key_rotation.enabled {
        (candidates.len().max(1)) * 2
    } else {
        1
    };

    for p in &candidates {
        state.load_balancer.ensure_provider(&p.name, p.api_keys.len()).await;
    }

    let mut retry_count = 0u32;
    let mut last_error: Option<Classification> = None;

    for _attempt in 0..max_attempts {
        let provider = match state.load_balancer.select_provider(&candidates, config.proxy.load_balance).await {
            Some(p) => p.clone(),
            None => match state.load_balancer.recover(&candidates).await {
                Some(_) => continue,
                None => break,
            },
        };

        let key_index = match state.load_balancer.select_key(&provider.name, provider.api_keys.len()).await {
            Some(idx) => idx,
            None => continue,
        };
        let api_key = provider.api_keys[key_index].clone();

        let upstream_url = format!("{}{}", provider.base_url, normalized_path.trim_start_matches('/'));
        let mut request_builder = state
            .http_client
            .post(&upstream_url)
            .timeout(provider.timeout())
            .json(&outbound_body);
        request_builder = apply_auth_header(request_builder, &provider, &api_key);
        request_builder = forward_headers(request_builder, &headers);
        for (k, v) in &provider.headers {
            request_builder = request_builder.header(k, v);
        }

        let upstream_started = Instant::now();
        let response = request_builder.send().await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                state.load_balancer.report_success(&provider.name, key_index).await;
                let upstream_status = resp.status().as_u16();
                let upstream_duration = upstream_started.elapsed().as_millis() as u64;

                state
                    .event_store
                    .update(
                        &id,
                        RecordPatch {
                            provider: Some(provider.name.clone()),
                            retry_count: Some(retry_count),
                            upstream_status: Some(upstream_status),
                            upstream_duration_ms: Some(upstream_duration),
                            ..Default::default()
                        },
                    )
                    .await;

                if streaming {
                    return build_streaming_response(state.clone(), id.clone(), dialect, mapped_model.clone(), resp, started);
                }

                let bytes = match resp.bytes().await {
                    Ok(b) => b,
                    Err(_) => {
                        return finalize_error(&state, &id, started, StatusCode::BAD_GATEWAY, "upstream_error", "failed to read upstream body").await;
                    }
                };
                let upstream_json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                let client_json = match dialect {
                    Dialect::Anthropic => anthropic::response_from_openai(&upstream_json, &requested_model),
                    Dialect::Responses => responses::response_from_openai(&upstream_json, &requested_model),
                    Dialect::OpenAiChat => upstream_json,
                };

                state
                    .event_store
                    .update(
                        &id,
                        RecordPatch {
                            status: Some(200),
                            duration_ms: Some(started.elapsed().as_millis() as u64),
                            ..Default::default()
                        },
                    )
                    .await;

                return Json(client_json).into_response();
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.bytes().await.unwrap_or_default();
                let classification = classify::classify_http_response(status, &body);
                state.load_balancer.report_error(&provider.name, key_index, &classification).await;
                retry_count += 1;
                let should_retry = classification.retryable;
                last_error = Some(classification.clone());
                if !should_retry {
                    return finalize_error(
                        &state,
                        &id,
                        started,
                        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                        &classification.kind.to_string(),
                        &classification.message,
                    )
                    .await;
                }
            }
            Err(e) => {
                let classification = classify::classify_transport_error(&e.to_string());
                state.load_balancer.report_error(&provider.name, key_index, &classification).await;
                retry_count += 1;
                last_error = Some(classification);
            }
        }
    }

    let (status, kind, message) = match last_error {
        Some(c) => (StatusCode::BAD_GATEWAY, c.kind.to_string(), c.message),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no_provider".to_string(), "no healthy provider available".to_string()),
    };
    finalize_error(&state, &id, started, status, &kind, &message).await
}

async fn finalize_error(
    state: &AppState,
    id: &str,
    started: Instant,
    status: StatusCode,
    kind: &str,
    message: &str,
) -> Response {
    state
        .event_store
        .update(
            id,
            RecordPatch {
                status: Some(status.as_u16()),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                error_type: Some(kind.to_string()),
                error_message: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await;
    error_response(status, kind, message)
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({"error": {"type": kind, "message": message}}))).into_response()
}

fn bad_request(message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
}

fn apply_auth_header(builder: reqwest::RequestBuilder, provider: &Provider, api_key: &str) -> reqwest::RequestBuilder {
    match provider.tool_format {
        ToolFormat::Anthropic => builder.header("x-api-key", api_key).header("anthropic-version", "2023-06-01"),
        ToolFormat::Openai => builder.header("Authorization", format!("Bearer {}", api_key)),
    }
}

fn forward_headers(mut builder: reqwest::RequestBuilder, headers: &HeaderMap) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
}

/// Build a streaming (SSE) response, consuming the upstream body chunk by
/// chunk and translating into the client's dialect as it arrives.
fn build_streaming_response(
    state: Arc<AppState>,
    id: String,
    dialect: Dialect,
    model: String,
    upstream: reqwest::Response,
    started: Instant,
) -> Response {
    let mut upstream_stream = upstream.bytes_stream();
    let msg_id = format!("msg_{}", Uuid::new_v4().simple());

    let body_stream = async_stream::stream! {
        let mut tokenizer = SseTokenizer::new();
        let mut anthropic_translator = AnthropicStreamTranslator::new(msg_id.clone(), model.clone());
        let mut responses_translator = ResponsesStreamTranslator::new(msg_id.clone(), model.clone());

        while let Some(chunk) = upstream_stream.next().await {
            let Ok(chunk) = chunk else { break };
            for payload in tokenizer.push(&chunk) {
                match dialect {
                    Dialect::Anthropic => {
                        for event in anthropic_translator.push(&payload) {
                            yield Ok::<_, std::convert::Infallible>(bytes::Bytes::from(event));
                        }
                    }
                    Dialect::Responses => {
                        for event in responses_translator.push(&payload) {
                            yield Ok(bytes::Bytes::from(event));
                        }
                    }
                    Dialect::OpenAiChat => {
                        let raw = if payload == "[DONE]" {
                            crate::sse::DONE_EVENT.to_string()
                        } else {
                            crate::sse::format_data(&serde_json::from_str(&payload).unwrap_or(Value::Null))
                        };
                        yield Ok(bytes::Bytes::from(raw));
                    }
                }
            }
        }

        state
            .event_store
            .update(
                &id,
                RecordPatch {
                    status: Some(200),
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                    ..Default::default()
                },
            )
            .await;
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(tool_format: ToolFormat) -> Provider {
        Provider {
            name: "p".to_string(),
            base_url: "https://example.test".parse().unwrap(),
            models: vec!["m".to_string()],
            api_keys: vec!["k".to_string()],
            priority: None,
            weight: 1,
            timeout_ms: 1000,
            headers: HashMap::new(),
            tool_format,
        }
    }

    #[test]
    fn forward_headers_strips_auth_and_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.insert("host", HeaderValue::from_static("localhost"));

        let client = reqwest::Client::new();
        let builder = client.post("https://example.test");
        let built = forward_headers(builder, &headers).build().unwrap();
        assert!(built.headers().get("authorization").is_none());
        assert!(built.headers().get("host").is_none());
        assert_eq!(built.headers().get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn auth_header_matches_tool_format() {
        let client = reqwest::Client::new();
        let openai_req = apply_auth_header(client.post("https://x"), &provider(ToolFormat::Openai), "k1")
            .build()
            .unwrap();
        assert_eq!(openai_req.headers().get("authorization").unwrap(), "Bearer k1");

        let anthropic_req = apply_auth_header(client.post("https://x"), &provider(ToolFormat::Anthropic), "k1")
            .build()
            .unwrap();
        assert_eq!(anthropic_req.headers().get("x-api-key").unwrap(), "k1");
    }
}
