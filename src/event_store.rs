//! Event store (C5): a bounded, redacted audit ring of [`ProxyRecord`]s with
//! live subscriber fan-out.
//!
//! Ownership rule from the specification: records are exclusively owned by
//! this module; request handlers only ever get at them through
//! `start`/`update`/`finalize`. Subscribers receive immutable snapshots.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

const DEFAULT_MAX_RECORDS: usize = 200;
const DEFAULT_MAX_BODY_BYTES: usize = 8_000;
/// Bound on each subscriber's queue; a slow subscriber is dropped rather
/// than allowed to block producers.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

fn redacted_header_names() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            "authorization",
            "proxy-authorization",
            "x-api-key",
            "x-claude-api-key",
            "x-anthropic-api-key",
            "api-key",
            "cookie",
        ]
        .into_iter()
        .collect()
    })
}

/// Lower-cases header names and replaces secret values with `[redacted]`.
pub fn redact_headers(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
    let redacted = redacted_header_names();
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            let value = if redacted.contains(name.as_str()) {
                "[redacted]".to_string()
            } else {
                value.to_str().unwrap_or("").to_string()
            };
            (name, value)
        })
        .collect()
}

/// One of the three body/header capture slots on a record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureSlot {
    pub headers: std::collections::BTreeMap<String, String>,
    pub body_preview: String,
    pub truncated: bool,
    pub size: usize,
}

impl CaptureSlot {
    fn new(headers: std::collections::BTreeMap<String, String>, body: &[u8], max_body_bytes: usize, capture_bodies: bool) -> Self {
        let size = body.len();
        if !capture_bodies {
            return Self {
                headers,
                body_preview: String::new(),
                truncated: false,
                size,
            };
        }
        let preview = body_preview_string(body);
        let truncated = preview.len() > max_body_bytes;
        let body_preview = if truncated {
            preview.chars().take(max_body_bytes).collect()
        } else {
            preview
        };
        Self {
            headers,
            body_preview,
            truncated,
            size,
        }
    }
}

fn body_preview_string(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(s) => {
            // Re-stringify JSON bodies through serde_json so the preview is
            // canonical even when the original had unusual whitespace; fall
            // back to the raw text for non-JSON bodies.
            match serde_json::from_str::<serde_json::Value>(s) {
                Ok(v) => serde_json::to_string(&v).unwrap_or_else(|_| "[unserializable]".to_string()),
                Err(_) => s.to_string(),
            }
        }
        Err(_) => "[unserializable]".to_string(),
    }
}

/// One audit record per client request.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRecord {
    pub id: String,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub streaming: bool,
    pub status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub upstream_status: Option<u16>,
    pub upstream_duration_ms: Option<u64>,
    pub retry_count: u32,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub request: CaptureSlot,
    pub upstream: Option<CaptureSlot>,
    pub response: Option<CaptureSlot>,
}

/// Patch applied by `update`/`finalize`. `None` fields are left unchanged.
#[derive(Debug, Default)]
pub struct RecordPatch {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub streaming: Option<bool>,
    pub status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub upstream_status: Option<u16>,
    pub upstream_duration_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub upstream: Option<CaptureSlot>,
    pub response: Option<CaptureSlot>,
}

impl ProxyRecord {
    fn apply(&mut self, patch: RecordPatch) {
        if let Some(v) = patch.model {
            self.model = Some(v);
        }
        if let Some(v) = patch.provider {
            self.provider = Some(v);
        }
        if let Some(v) = patch.streaming {
            self.streaming = v;
        }
        if let Some(v) = patch.status {
            self.status = Some(v);
        }
        if let Some(v) = patch.duration_ms {
            self.duration_ms = Some(v);
        }
        if let Some(v) = patch.upstream_status {
            self.upstream_status = Some(v);
        }
        if let Some(v) = patch.upstream_duration_ms {
            self.upstream_duration_ms = Some(v);
        }
        if let Some(v) = patch.retry_count {
            self.retry_count = v;
        }
        if let Some(v) = patch.error_type {
            self.error_type = Some(v);
        }
        if let Some(v) = patch.error_message {
            self.error_message = Some(v);
        }
        if let Some(v) = patch.finished_at {
            self.finished_at = Some(v);
        }
        if let Some(v) = patch.upstream {
            self.upstream = Some(v);
        }
        if let Some(v) = patch.response {
            self.response = Some(v);
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProxyRecord>,
}

struct Inner {
    ring: VecDeque<ProxyRecord>,
    max_records: usize,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Configuration affecting body capture (the only store behaviour that is
/// config-dependent; everything else — redaction, ring size — is fixed).
#[derive(Debug, Clone, Copy)]
pub struct EventStoreConfig {
    pub max_records: usize,
    pub capture_bodies: bool,
    pub max_body_bytes: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            capture_bodies: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

pub struct EventStore {
    inner: RwLock<Inner>,
    config: EventStoreConfig,
}

pub type SharedEventStore = Arc<EventStore>;

/// An unsubscribe handle; dropping it (or calling `unsubscribe`) removes the
/// subscriber from the fan-out set.
pub struct Subscription {
    store: Arc<EventStore>,
    id: u64,
    pub rx: mpsc::Receiver<ProxyRecord>,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        let mut inner = self.store.inner.write().await;
        inner.subscribers.retain(|s| s.id != self.id);
    }
}

impl EventStore {
    pub fn new(config: EventStoreConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ring: VecDeque::with_capacity(config.max_records),
                max_records: config.max_records,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            config,
        }
    }

    pub fn capture_slot(&self, headers: &HeaderMap, body: &[u8]) -> CaptureSlot {
        CaptureSlot::new(
            redact_headers(headers),
            body,
            self.config.max_body_bytes,
            self.config.capture_bodies,
        )
    }

    pub async fn start(
        &self,
        id: String,
        method: String,
        path: String,
        headers: &HeaderMap,
        body: &[u8],
        streaming: bool,
        model: Option<String>,
        provider: Option<String>,
    ) {
        let record = ProxyRecord {
            id,
            method,
            path,
            model,
            provider,
            streaming,
            status: None,
            duration_ms: None,
            upstream_status: None,
            upstream_duration_ms: None,
            retry_count: 0,
            error_type: None,
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
            request: self.capture_slot(headers, body),
            upstream: None,
            response: None,
        };
        self.insert(record).await;
    }

    async fn insert(&self, record: ProxyRecord) {
        let mut inner = self.inner.write().await;
        if inner.ring.len() >= inner.max_records {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
    }

    pub async fn update(&self, id: &str, patch: RecordPatch) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let Some(record) = inner.ring.iter_mut().find(|r| r.id == id) else {
                return;
            };
            record.apply(patch);
            record.clone()
        };
        self.broadcast(snapshot).await;
    }

    pub async fn finalize(
        &self,
        id: &str,
        status: u16,
        duration_ms: u64,
        finished_at: Option<DateTime<Utc>>,
        response: Option<CaptureSlot>,
        upstream: Option<CaptureSlot>,
        error_type: Option<String>,
        error_message: Option<String>,
        retry_count: Option<u32>,
    ) {
        let patch = RecordPatch {
            status: Some(status),
            duration_ms: Some(duration_ms),
            finished_at: Some(finished_at.unwrap_or_else(Utc::now)),
            response,
            upstream,
            error_type,
            error_message,
            retry_count,
            ..Default::default()
        };
        self.update(id, patch).await;
    }

    /// Newest-first snapshot of all retained records.
    pub async fn snapshot(&self) -> Vec<ProxyRecord> {
        let inner = self.inner.read().await;
        inner.ring.iter().rev().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<ProxyRecord> {
        let inner = self.inner.read().await;
        inner.ring.iter().find(|r| r.id == id).cloned()
    }

    /// Subscribe to live record updates. Returns a bounded receiver; if the
    /// subscriber falls behind, a later broadcast drops it rather than
    /// blocking request handling.
    pub async fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.write().await;
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        Subscription {
            store: Arc::clone(self),
            id,
            rx,
        }
    }

    async fn broadcast(&self, record: ProxyRecord) {
        // Snapshot the subscriber list, then notify without holding the
        // write lock — a slow subscriber must not block request handling.
        let mut dead = Vec::new();
        {
            let inner = self.inner.read().await;
            for sub in &inner.subscribers {
                if sub.tx.try_send(record.clone()).is_err() {
                    dead.push(sub.id);
                }
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            inner.subscribers.retain(|s| !dead.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_auth() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer secret"));
        h.insert("x-request-id", HeaderValue::from_static("abc"));
        h
    }

    #[tokio::test]
    async fn start_then_finalize_yields_exactly_one_record() {
        let store = Arc::new(EventStore::new(EventStoreConfig::default()));
        store
            .start(
                "r1".to_string(),
                "POST".to_string(),
                "/v1/chat/completions".to_string(),
                &headers_with_auth(),
                b"{\"model\":\"m\"}",
                false,
                Some("m".to_string()),
                None,
            )
            .await;
        store
            .finalize("r1", 200, 42, None, None, None, None, None, Some(0))
            .await;

        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, Some(200));
        assert_eq!(snap[0].duration_ms, Some(42));
    }

    #[tokio::test]
    async fn redacts_authorization_header() {
        let store = EventStore::new(EventStoreConfig::default());
        let slot = store.capture_slot(&headers_with_auth(), b"{}");
        assert_eq!(slot.headers.get("authorization").unwrap(), "[redacted]");
        assert_eq!(slot.headers.get("x-request-id").unwrap(), "abc");
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_first() {
        let store = EventStore::new(EventStoreConfig {
            max_records: 2,
            ..Default::default()
        });
        for i in 0..3 {
            store
                .start(
                    format!("r{i}"),
                    "GET".to_string(),
                    "/".to_string(),
                    &HeaderMap::new(),
                    b"",
                    false,
                    None,
                    None,
                )
                .await;
        }
        let snap = store.snapshot().await;
        let ids: Vec<&str> = snap.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
    }

    #[tokio::test]
    async fn subscriber_receives_updates() {
        let store = Arc::new(EventStore::new(EventStoreConfig::default()));
        let mut sub = store.subscribe().await;
        store
            .start(
                "r1".to_string(),
                "GET".to_string(),
                "/".to_string(),
                &HeaderMap::new(),
                b"",
                false,
                None,
                None,
            )
            .await;
        store
            .finalize("r1", 200, 1, None, None, None, None, None, None)
            .await;
        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.id, "r1");
        assert_eq!(received.status, Some(200));
    }
}
