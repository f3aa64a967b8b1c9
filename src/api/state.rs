//! Shared application state handed to every axum handler.

use std::sync::Arc;

use crate::config_watcher::SharedConfig;
use crate::event_store::SharedEventStore;
use crate::load_balancer::LoadBalancer;

pub struct AppState {
    pub config: SharedConfig,
    pub load_balancer: Arc<LoadBalancer>,
    pub event_store: SharedEventStore,
    pub http_client: reqwest::Client,
}
