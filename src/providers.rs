//! Provider registry.
//!
//! Holds the registered providers of one configuration snapshot, a key pool per
//! static-key provider and one shared HTTP client per provider. Provider presets
//! (base URLs, dialects, key variables) live in `config/defaults.toml`.

use crate::config::EffectiveConfig;
use crate::error::{GatewayError, Result};
use crate::translate::Dialect;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

pub use crate::config::{AuthMode, ProviderConfig};

/// Version sent to Anthropic-dialect providers unless a custom header overrides it.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Ordered static keys handed out round-robin.
#[derive(Debug)]
pub struct ApiKeyPool {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        self.keys.get(index).map(String::as_str)
    }

    /// The key `next` would return, without advancing the cursor.
    pub fn peek(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.load(Ordering::Relaxed) % self.keys.len();
        self.keys.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Short, non-reversible label for a key in log lines.
pub fn fingerprint(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// A provider's HTTP client bound to one credential.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    provider: String,
    dialect: Dialect,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    headers: HeaderMap,
}

impl UpstreamClient {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Whole-request timeout for non-streaming calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST to `path` with auth and custom headers applied.
    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(self.url(path)).headers(self.headers.clone())
    }

    /// Path of the native chat endpoint, relative to the base URL.
    ///
    /// Anthropic presets carry a bare host, OpenAI presets already end in `/v1`.
    pub fn chat_path(&self) -> &'static str {
        self.dialect.chat_path()
    }
}

/// Builds upstream clients. The orchestrator depends on this, not on the registry.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, provider: &str, credential: &str) -> Result<UpstreamClient>;
}

#[derive(Debug)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderConfig>,
    pools: HashMap<String, ApiKeyPool>,
    clients: HashMap<String, reqwest::Client>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn from_config(config: &EffectiveConfig) -> Result<Self> {
        let mut pools = HashMap::new();
        let mut clients = HashMap::new();

        for (name, provider) in &config.providers {
            if provider.auth_mode != AuthMode::Passthrough {
                let keys = config.keys.get(name).unwrap_or_default().to_vec();
                debug!(provider = %name, keys = keys.len(), "Registered key pool");
                pools.insert(name.clone(), ApiKeyPool::new(keys));
            }

            let http = reqwest::Client::builder()
                .connect_timeout(provider.timeout)
                .build()
                .map_err(|e| {
                    GatewayError::config(format!("Failed to build HTTP client for '{name}': {e}"))
                })?;
            clients.insert(name.clone(), http);
        }

        Ok(Self {
            providers: config.providers.clone(),
            pools,
            clients,
            default_provider: config.default_provider.clone(),
        })
    }

    pub fn get_provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| GatewayError::config(format!("Provider '{name}' is not registered")))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Next static key for `provider`, round-robin across its pool.
    pub fn next_key(&self, provider: &str) -> Result<String> {
        self.draw_key(provider, ApiKeyPool::next)
    }

    /// Current key of the pool; the rotation order is left untouched.
    pub fn peek_key(&self, provider: &str) -> Result<String> {
        self.draw_key(provider, ApiKeyPool::peek)
    }

    fn draw_key(&self, provider: &str, draw: fn(&ApiKeyPool) -> Option<&str>) -> Result<String> {
        let config = self.get_provider(provider)?;
        if config.auth_mode == AuthMode::Passthrough {
            return Err(GatewayError::config(format!(
                "Provider '{provider}' uses passthrough authentication and holds no keys"
            )));
        }
        self.pools
            .get(provider)
            .and_then(draw)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::config(format!("Provider '{provider}' has no API keys")))
    }

    pub fn key_count(&self, provider: &str) -> usize {
        self.pools.get(provider).map_or(0, ApiKeyPool::len)
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }
}

impl ClientFactory for ProviderRegistry {
    fn client_for(&self, provider: &str, credential: &str) -> Result<UpstreamClient> {
        let config = self.get_provider(provider)?;
        let http = self
            .clients
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::config(format!("No HTTP client for '{provider}'")))?;

        let mut headers = HeaderMap::new();
        match config.dialect {
            Dialect::OpenAi => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {credential}"))?);
            }
            Dialect::Anthropic => {
                headers.insert("x-api-key", header_value(credential)?);
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            }
        }
        for (name, value) in &config.custom_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                GatewayError::config(format!("Invalid header name '{name}' for '{provider}': {e}"))
            })?;
            headers.insert(name, header_value(value)?);
        }

        Ok(UpstreamClient {
            provider: provider.to_string(),
            dialect: config.dialect,
            base_url: config.base_url.clone(),
            timeout: config.timeout,
            http,
            headers,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::config(format!("Invalid header value: {e}")))
}
