//! Gateway configuration: the validated shape the rest of the core treats as
//! read-only (§6.1). Loaded from a JSON or YAML file on disk and re-read by
//! [`crate::config_watcher`] on every file-change event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::load_balancer::LoadBalanceStrategy;

/// Tool-call wire format a provider expects on outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolFormat {
    #[default]
    Openai,
    Anthropic,
}

/// One configured upstream provider.
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub name: String,
    pub base_url: Url,
    pub models: Vec<String>,
    pub api_keys: Vec<String>,
    pub priority: Option<u32>,
    pub weight: u32,
    pub timeout_ms: u64,
    pub headers: HashMap<String, String>,
    pub tool_format: ToolFormat,
}

impl Provider {
    /// Bidirectional-prefix model support check used by the model router
    /// (§4.4): a provider supports `model` iff either string is a prefix of
    /// the other.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models
            .iter()
            .any(|m| m.starts_with(model) || model.starts_with(m.as_str()))
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Key rotation behaviour.
#[derive(Debug, Clone, Serialize)]
pub struct KeyRotationConfig {
    pub enabled: bool,
    pub on_error: bool,
    pub cooldown_ms: u64,
}

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_error: true,
            cooldown_ms: 60_000,
        }
    }
}

/// Proxy-facing settings: bind address, auth, routing policy.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub access_key: Option<String>,
    pub load_balance: LoadBalanceStrategy,
    pub model_mapping: HashMap<String, String>,
    pub passthrough_responses_api: Vec<String>,
    pub key_rotation: KeyRotationConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4320,
            access_key: None,
            load_balance: LoadBalanceStrategy::Failover,
            model_mapping: HashMap::new(),
            passthrough_responses_api: Vec::new(),
            key_rotation: KeyRotationConfig::default(),
        }
    }
}

/// The fully validated, read-only configuration object.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub providers: Vec<Provider>,
    pub default_model: Option<String>,
    pub proxy: ProxyConfig,
}

impl Config {
    /// Whether `model` matches any configured pass-through pattern
    /// (exact match or `prefix*`).
    pub fn is_passthrough_responses_model(&self, model: &str) -> bool {
        self.proxy.passthrough_responses_api.iter().any(|pat| {
            if let Some(prefix) = pat.strip_suffix('*') {
                model.starts_with(prefix)
            } else {
                pat == model
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Raw (on-disk) shape + validation
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawProvider {
    name: String,
    #[serde(rename = "baseUrl")]
    base_url: String,
    models: Vec<String>,
    #[serde(rename = "apiKeys")]
    api_keys: Vec<String>,
    priority: Option<u32>,
    weight: Option<u32>,
    timeout: Option<u64>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(rename = "toolFormat")]
    tool_format: Option<ToolFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct RawKeyRotation {
    enabled: Option<bool>,
    #[serde(rename = "onError")]
    on_error: Option<bool>,
    #[serde(rename = "cooldownMs")]
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawProxy {
    host: Option<String>,
    port: Option<u16>,
    #[serde(rename = "accessKey")]
    access_key: Option<String>,
    #[serde(rename = "loadBalance")]
    load_balance: Option<LoadBalanceStrategy>,
    #[serde(rename = "modelMapping", default)]
    model_mapping: HashMap<String, String>,
    #[serde(rename = "passthroughResponsesAPI", default)]
    passthrough_responses_api: Vec<String>,
    #[serde(rename = "keyRotation", default)]
    key_rotation: RawKeyRotation,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    providers: Vec<RawProvider>,
    #[serde(rename = "defaultModel")]
    default_model: Option<String>,
    #[serde(default)]
    proxy: RawProxy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("config has no providers")]
    NoProviders,
    #[error("provider '{0}' has an empty apiKeys list")]
    EmptyApiKeys(String),
    #[error("provider '{0}' has an empty models list")]
    EmptyModels(String),
    #[error("provider '{0}' has an invalid baseUrl: {1}")]
    InvalidBaseUrl(String, String),
    #[error("duplicate provider name '{0}'")]
    DuplicateProvider(String),
}

/// Load and validate the configuration file at `path`. JSON or YAML,
/// selected by extension (`.json` vs anything else defaulting to YAML).
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, path)
}

fn parse(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let raw: RawConfig = if is_json {
        serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e.into(),
        })?
    } else {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e.into(),
        })?
    };
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    if raw.providers.is_empty() {
        return Err(ConfigError::NoProviders);
    }

    let mut seen = std::collections::HashSet::new();
    let mut providers = Vec::with_capacity(raw.providers.len());
    for p in raw.providers {
        if !seen.insert(p.name.clone()) {
            return Err(ConfigError::DuplicateProvider(p.name));
        }
        if p.api_keys.is_empty() {
            return Err(ConfigError::EmptyApiKeys(p.name));
        }
        if p.models.is_empty() {
            return Err(ConfigError::EmptyModels(p.name));
        }
        let trimmed = p.base_url.trim_end_matches('/');
        let base_url = Url::parse(trimmed)
            .map_err(|e| ConfigError::InvalidBaseUrl(p.name.clone(), e.to_string()))?;

        providers.push(Provider {
            name: p.name,
            base_url,
            models: p.models,
            api_keys: p.api_keys,
            priority: p.priority,
            weight: p.weight.unwrap_or(1),
            timeout_ms: p.timeout.unwrap_or(60_000),
            headers: p.headers,
            tool_format: p.tool_format.unwrap_or_default(),
        });
    }

    let port = raw.proxy.port.unwrap_or(4320);

    let proxy = ProxyConfig {
        host: raw.proxy.host.unwrap_or_else(|| "127.0.0.1".to_string()),
        port,
        access_key: raw.proxy.access_key,
        load_balance: raw.proxy.load_balance.unwrap_or_default(),
        model_mapping: raw.proxy.model_mapping,
        passthrough_responses_api: raw.proxy.passthrough_responses_api,
        key_rotation: KeyRotationConfig {
            enabled: raw.proxy.key_rotation.enabled.unwrap_or(true),
            on_error: raw.proxy.key_rotation.on_error.unwrap_or(true),
            cooldown_ms: raw.proxy.key_rotation.cooldown_ms.unwrap_or(60_000),
        },
    };

    Ok(Config {
        providers,
        default_model: raw.default_model,
        proxy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "providers": [
                {"name":"a","baseUrl":"https://a.test/","models":["gpt-4o"],"apiKeys":["k1"],"priority":1}
            ],
            "defaultModel": "gpt-4o",
            "proxy": {"port": 5555, "loadBalance": "round-robin"}
        }"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let cfg = parse(sample_json(), Path::new("config.json")).unwrap();
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].base_url.as_str(), "https://a.test/");
        assert_eq!(cfg.proxy.port, 5555);
        assert_eq!(cfg.proxy.load_balance, LoadBalanceStrategy::RoundRobin);
    }

    #[test]
    fn rejects_empty_providers() {
        let raw = r#"{"providers":[]}"#;
        let err = parse(raw, Path::new("c.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NoProviders));
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let raw = r#"{"providers":[
            {"name":"a","baseUrl":"https://a.test","models":["m"],"apiKeys":["k"]},
            {"name":"a","baseUrl":"https://b.test","models":["m"],"apiKeys":["k"]}
        ]}"#;
        let err = parse(raw, Path::new("c.json")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProvider(_)));
    }

    #[test]
    fn passthrough_prefix_matching() {
        let mut cfg = parse(sample_json(), Path::new("c.json")).unwrap();
        cfg.proxy.passthrough_responses_api = vec!["gpt-5*".to_string()];
        assert!(cfg.is_passthrough_responses_model("gpt-5-pro"));
        assert!(!cfg.is_passthrough_responses_model("gpt-4o"));
    }
}
