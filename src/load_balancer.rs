//! Load balancing (C2): per-provider and per-key health tracking, provider
//! and key selection, and the forced-recovery path used when every provider
//! has run out of usable keys.
//!
//! Ownership rule from the specification: `ProviderState`/`KeyState` are
//! exclusively owned by this module. Nothing outside `LoadBalancer` may
//! mutate them directly — callers go through `report_success`/`report_error`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use crate::classify::Classification;
use crate::config::Provider;

/// Strategy used to pick a provider among the currently available set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    Failover,
    RoundRobin,
    Random,
    Weighted,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::Failover
    }
}

/// Runtime health state for a single key within a provider.
#[derive(Debug, Clone)]
pub struct KeyState {
    pub healthy: bool,
    pub last_used: Option<Instant>,
    pub last_error: Option<String>,
    pub last_error_time: Option<Instant>,
    pub cooldown_until: Option<Instant>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            healthy: true,
            last_used: None,
            last_error: None,
            last_error_time: None,
            cooldown_until: None,
        }
    }
}

impl KeyState {
    /// A key is available iff healthy, or its cooldown has elapsed.
    fn is_available(&self, now: Instant) -> bool {
        self.healthy || self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }
}

/// Runtime health state for a single provider.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub healthy: bool,
    pub current_key_index: usize,
    pub failed_keys: HashSet<usize>,
    pub last_error: Option<String>,
    pub last_error_time: Option<Instant>,
    pub request_count: u64,
    pub error_count: u64,
    pub keys: Vec<KeyState>,
}

impl ProviderState {
    fn new(num_keys: usize) -> Self {
        Self {
            healthy: true,
            current_key_index: 0,
            failed_keys: HashSet::new(),
            last_error: None,
            last_error_time: None,
            request_count: 0,
            error_count: 0,
            keys: (0..num_keys).map(|_| KeyState::default()).collect(),
        }
    }

    /// A provider is available iff it has at least one available key.
    fn is_available(&self, now: Instant) -> bool {
        self.keys.iter().any(|k| k.is_available(now))
    }
}

/// Serializable counters exposed on `GET /stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub healthy: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub current_key_index: usize,
    pub failed_key_count: usize,
    pub total_keys: usize,
}

const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Process-wide, constructor-injected load balancer. Holds no global statics
/// so tests can build isolated instances.
#[derive(Debug)]
pub struct LoadBalancer {
    states: RwLock<HashMap<String, ProviderState>>,
    round_robin_cursor: std::sync::atomic::AtomicUsize,
    cooldown: Duration,
}

pub type SharedLoadBalancer = Arc<LoadBalancer>;

impl LoadBalancer {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            round_robin_cursor: std::sync::atomic::AtomicUsize::new(0),
            cooldown: Duration::from_millis(if cooldown_ms == 0 {
                DEFAULT_COOLDOWN_MS
            } else {
                cooldown_ms
            }),
        }
    }

    /// Ensure a provider has runtime state, creating it with `num_keys`
    /// fresh `KeyState`s on first sight. Re-sizing an existing provider
    /// (keys added/removed by a config reload) preserves existing state
    /// for indices still in range.
    pub async fn ensure_provider(&self, name: &str, num_keys: usize) {
        let mut states = self.states.write().await;
        match states.get_mut(name) {
            Some(existing) if existing.keys.len() != num_keys => {
                existing.keys.resize_with(num_keys, KeyState::default);
                existing.failed_keys.retain(|&i| i < num_keys);
                if existing.current_key_index >= num_keys {
                    existing.current_key_index = 0;
                }
            }
            Some(_) => {}
            None => {
                states.insert(name.to_string(), ProviderState::new(num_keys));
            }
        }
    }

    /// Pick an available provider from `providers` according to `strategy`.
    pub async fn select_provider<'a>(
        &self,
        providers: &'a [Provider],
        strategy: LoadBalanceStrategy,
    ) -> Option<&'a Provider> {
        let now = Instant::now();
        let states = self.states.read().await;
        let available: Vec<&Provider> = providers
            .iter()
            .filter(|p| {
                states
                    .get(&p.name)
                    .map(|s| s.is_available(now))
                    .unwrap_or(true)
            })
            .collect();
        if available.is_empty() {
            return None;
        }

        match strategy {
            LoadBalanceStrategy::Failover => available
                .into_iter()
                .min_by_key(|p| (p.priority.unwrap_or(u32::MAX), p.name.clone()))
                .map(|p| p as &Provider),
            LoadBalanceStrategy::RoundRobin => {
                let idx = self
                    .round_robin_cursor
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % available.len();
                Some(available[idx])
            }
            LoadBalanceStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..available.len());
                Some(available[idx])
            }
            LoadBalanceStrategy::Weighted => {
                let total: u32 = available.iter().map(|p| p.weight.max(1)).sum();
                let mut pick = rand::thread_rng().gen_range(0..total.max(1));
                for p in &available {
                    let w = p.weight.max(1);
                    if pick < w {
                        return Some(p);
                    }
                    pick -= w;
                }
                available.last().copied()
            }
        }
    }

    /// Select a usable key index within `provider_name`, starting at the
    /// provider's `current_key_index` and scanning forward with wraparound.
    /// A key whose cooldown has elapsed is reset to healthy in place.
    pub async fn select_key(&self, provider_name: &str, num_keys: usize) -> Option<usize> {
        if num_keys == 0 {
            return None;
        }
        let now = Instant::now();
        let mut states = self.states.write().await;
        let state = states
            .entry(provider_name.to_string())
            .or_insert_with(|| ProviderState::new(num_keys));

        let start = state.current_key_index % num_keys;
        for offset in 0..num_keys {
            let idx = (start + offset) % num_keys;
            let key = &mut state.keys[idx];
            if key.healthy {
                return Some(idx);
            }
            if key.cooldown_until.map(|u| now >= u).unwrap_or(false) {
                key.healthy = true;
                key.cooldown_until = None;
                return Some(idx);
            }
        }
        None
    }

    pub async fn report_success(&self, provider_name: &str, key_index: usize) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(provider_name) {
            state.request_count += 1;
            state.healthy = true;
            if let Some(key) = state.keys.get_mut(key_index) {
                key.healthy = true;
                key.last_used = Some(Instant::now());
            }
        }
    }

    pub async fn report_error(
        &self,
        provider_name: &str,
        key_index: usize,
        err: &Classification,
    ) {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(provider_name) else {
            return;
        };
        state.error_count += 1;
        state.last_error = Some(err.message.clone());
        state.last_error_time = Some(Instant::now());

        if err.should_rotate_key {
            let num_keys = state.keys.len();
            if let Some(key) = state.keys.get_mut(key_index) {
                key.healthy = false;
                key.last_error = Some(err.message.clone());
                key.last_error_time = Some(Instant::now());
                key.cooldown_until = Some(Instant::now() + self.cooldown);
            }
            state.failed_keys.insert(key_index);
            if num_keys > 0 {
                state.current_key_index = (key_index + 1) % num_keys;
            }
            if state.failed_keys.len() >= num_keys {
                state.healthy = false;
                tracing::warn!(provider = provider_name, "provider marked unhealthy: all keys exhausted");
            }
        }
    }

    /// Forced recovery when no provider in `providers` has an available key:
    /// pick the provider with smallest priority (tiebreak by oldest
    /// `last_error_time`), reset all its keys to healthy and return its name.
    pub async fn recover(&self, providers: &[Provider]) -> Option<String> {
        if providers.is_empty() {
            return None;
        }
        let mut states = self.states.write().await;
        let chosen = providers
            .iter()
            .min_by(|a, b| {
                let pa = a.priority.unwrap_or(u32::MAX);
                let pb = b.priority.unwrap_or(u32::MAX);
                pa.cmp(&pb).then_with(|| {
                    let ea = states.get(&a.name).and_then(|s| s.last_error_time);
                    let eb = states.get(&b.name).and_then(|s| s.last_error_time);
                    match (ea, eb) {
                        (Some(ea), Some(eb)) => ea.cmp(&eb),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    }
                })
            })?
            .clone();

        let state = states
            .entry(chosen.name.clone())
            .or_insert_with(|| ProviderState::new(chosen.api_keys.len()));
        for key in &mut state.keys {
            *key = KeyState::default();
        }
        state.failed_keys.clear();
        state.current_key_index = 0;
        state.healthy = true;
        tracing::warn!(provider = %chosen.name, "forced recovery: all keys reset to healthy");
        Some(chosen.name)
    }

    pub async fn stats(&self) -> Vec<ProviderStats> {
        let states = self.states.read().await;
        states
            .iter()
            .map(|(name, s)| ProviderStats {
                provider: name.clone(),
                healthy: s.healthy,
                request_count: s.request_count,
                error_count: s.error_count,
                current_key_index: s.current_key_index,
                failed_key_count: s.failed_keys.len(),
                total_keys: s.keys.len(),
            })
            .collect()
    }

    pub async fn is_provider_healthy(&self, name: &str) -> bool {
        let now = Instant::now();
        self.states
            .read()
            .await
            .get(name)
            .map(|s| s.is_available(now))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorKind;

    fn provider(name: &str, priority: Option<u32>, keys: usize) -> Provider {
        Provider {
            name: name.to_string(),
            base_url: "https://example.test".parse().unwrap(),
            models: vec!["m".to_string()],
            api_keys: (0..keys).map(|i| format!("k{i}")).collect(),
            priority,
            weight: 1,
            timeout_ms: 60_000,
            headers: HashMap::new(),
            tool_format: crate::config::ToolFormat::Openai,
        }
    }

    fn rotate_error() -> Classification {
        Classification {
            kind: ErrorKind::AuthFailure,
            retryable: false,
            should_rotate_key: true,
            message: "unauthorized".to_string(),
        }
    }

    #[tokio::test]
    async fn failover_picks_smallest_priority() {
        let lb = LoadBalancer::new(60_000);
        let providers = vec![provider("b", Some(2), 1), provider("a", Some(1), 1)];
        for p in &providers {
            lb.ensure_provider(&p.name, p.api_keys.len()).await;
        }
        let picked = lb
            .select_provider(&providers, LoadBalanceStrategy::Failover)
            .await
            .unwrap();
        assert_eq!(picked.name, "a");
    }

    #[tokio::test]
    async fn key_rotation_sets_cooldown_and_advances_cursor() {
        let lb = LoadBalancer::new(60_000);
        lb.ensure_provider("a", 2).await;
        let idx = lb.select_key("a", 2).await.unwrap();
        assert_eq!(idx, 0);
        lb.report_error("a", 0, &rotate_error()).await;
        let idx2 = lb.select_key("a", 2).await.unwrap();
        assert_eq!(idx2, 1);
    }

    #[tokio::test]
    async fn provider_becomes_unhealthy_after_all_keys_rotate() {
        let lb = LoadBalancer::new(60_000);
        lb.ensure_provider("a", 2).await;
        lb.report_error("a", 0, &rotate_error()).await;
        lb.report_error("a", 1, &rotate_error()).await;
        assert!(!lb.is_provider_healthy("a").await);
    }

    #[tokio::test]
    async fn recovery_resets_all_keys_of_lowest_priority_provider() {
        let lb = LoadBalancer::new(60_000);
        let providers = vec![provider("a", Some(1), 2)];
        lb.ensure_provider("a", 2).await;
        lb.report_error("a", 0, &rotate_error()).await;
        lb.report_error("a", 1, &rotate_error()).await;
        assert!(!lb.is_provider_healthy("a").await);

        let recovered = lb.recover(&providers).await;
        assert_eq!(recovered.as_deref(), Some("a"));
        assert!(lb.is_provider_healthy("a").await);
        let stats = lb.stats().await;
        assert_eq!(stats[0].failed_key_count, 0);
    }
}
