//! Router assembly and process entry point for the gateway's HTTP surface.

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    response::Json,
    routing::{any, get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config_watcher;
use crate::event_store::{EventStore, EventStoreConfig};
use crate::load_balancer::LoadBalancer;

use super::admin;
use super::auth;
use super::gateway;
use super::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({"name": "xling-gateway", "version": env!("CARGO_PKG_VERSION")}))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"providers": state.load_balancer.stats().await}))
}

async fn models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let config = state.config.load_full();
    let created = chrono::Utc::now().timestamp();
    let mut data: Vec<serde_json::Value> = Vec::new();
    let mut seen_bare = std::collections::HashSet::new();

    for p in &config.providers {
        for m in &p.models {
            data.push(json!({
                "id": format!("{},{}", p.name, m),
                "object": "model",
                "created": created,
                "owned_by": p.name,
            }));
            if seen_bare.insert(m.clone()) {
                data.push(json!({
                    "id": m,
                    "object": "model",
                    "created": created,
                    "owned_by": p.name,
                }));
            }
        }
    }

    Json(json!({"object": "list", "data": data}))
}

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/", get(root))
        .route("/stats", get(stats))
        .route("/v1/models", get(models))
        .route("/models", get(models))
}

fn proxy_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/*rest", any(gateway::handle))
        .route("/claude/*rest", any(gateway::handle))
        .route("/openai/*rest", any(gateway::handle))
        .route("/responses", post(gateway::handle))
        .route("/messages", post(gateway::handle))
        .route("/chat/completions", post(gateway::handle))
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/proxy/records", get(admin::records))
        .route("/proxy/stream", get(admin::stream))
        .route("/proxy/export", get(admin::export))
        .route("/proxy/analyze", post(admin::analyze))
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = proxy_routes()
        .merge(admin_routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_access_key));

    Router::new()
        .merge(public_routes())
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load config, stand up shared state, and serve until the process is
/// killed. Holds the file watcher alive for the lifetime of the server.
pub async fn serve(config_path: std::path::PathBuf) -> anyhow::Result<()> {
    let (config, _watcher) = config_watcher::watch(&config_path)?;
    let cooldown_ms = config.load().proxy.key_rotation.cooldown_ms;

    let state = Arc::new(AppState {
        config,
        load_balancer: Arc::new(LoadBalancer::new(cooldown_ms)),
        event_store: Arc::new(EventStore::new(EventStoreConfig::default())),
        http_client: reqwest::Client::builder().build()?,
    });

    let addr = format!("{}:{}", state.config.load().proxy.host, state.config.load().proxy.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
