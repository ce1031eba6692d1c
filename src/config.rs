//! Layered configuration.
//!
//! Tiers, lowest precedence first: the bundled `config/defaults.toml`, the
//! user file under the platform config directory, `./llm-relay.toml`, then
//! environment variables. TOML tiers are deep-merged table by table, so a
//! higher tier adding one alias keeps every alias declared below it.
//!
//! Top-level tables whose name starts with `#` declare profiles: a named
//! bundle of aliases plus timeout and retry overrides, selected with a
//! `profile:alias` model string.

use crate::error::{GatewayError, Result};
use crate::translate::Dialect;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const BUNDLED_DEFAULTS: &str = include_str!("../config/defaults.toml");

/// API key value that switches a provider to client-key passthrough.
pub const PASSTHROUGH_SENTINEL: &str = "!PASSTHRU";

pub const PROJECT_CONFIG_FILE: &str = "llm-relay.toml";

/// Marks a top-level table as a profile.
pub const PROFILE_MARKER: char = '#';

const DEFAULT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_ALIAS_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_ALIAS_CACHE_SIZE: usize = 1024;
const DEFAULT_STREAMING_READ_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PORT: u16 = 4222;

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ledger_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DefaultsSection {
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub alias_cache_ttl: Option<u64>,
    pub alias_cache_size: Option<usize>,
    pub streaming_read_timeout: Option<u64>,
    /// Reject invalid profile aliases instead of dropping them.
    pub strict_profile_validation: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProfileSection {
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderSection {
    pub base_url: Option<String>,
    pub api_format: Option<String>,
    pub auth_mode: Option<String>,
    pub api_key: Option<String>,
    /// Extra environment variable consulted for the key, e.g. `XAI_API_KEY`.
    pub api_key_env: Option<String>,
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Effective configuration
// ---------------------------------------------------------------------------

/// How a provider authenticates upstream. Decided once, at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    StaticSingle,
    StaticRotation,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    pub auth_mode: AuthMode,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_retries: u32,
    pub custom_headers: BTreeMap<String, String>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub mod option {
        use serde::Serializer;
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs()),
                None => s.serialize_none(),
            }
        }
    }
}

/// A validated profile. Every alias target is `provider:model` naming a
/// registered provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(with = "duration_secs::option")]
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// lowercased alias -> `provider:model`
    pub aliases: BTreeMap<String, String>,
}

impl ProfileConfig {
    /// Overlay the profile's timeout and retry settings onto `provider`.
    pub fn apply(&self, provider: &mut ProviderConfig) {
        if let Some(timeout) = self.timeout {
            provider.timeout = timeout;
        }
        if let Some(max_retries) = self.max_retries {
            provider.max_retries = max_retries;
        }
    }
}

/// Static keys per provider. `Debug` never prints key material.
#[derive(Clone, Default)]
pub struct KeyRing(BTreeMap<String, Vec<String>>);

impl KeyRing {
    pub fn get(&self, provider: &str) -> Option<&[String]> {
        self.0.get(provider).map(Vec::as_slice)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| (k, format!("<{} keys>", v.len()))))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub ledger_file: Option<PathBuf>,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The merged result of every tier, ready for the registry and resolver.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub default_provider: String,
    pub server: ServerSettings,
    pub alias_cache_ttl: Duration,
    pub alias_cache_size: usize,
    pub streaming_read_timeout: Duration,
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Every provider name any tier mentions, registered or not.
    pub declared_providers: BTreeSet<String>,
    pub keys: KeyRing,
    /// provider -> lowercased alias -> target
    pub aliases: BTreeMap<String, BTreeMap<String, String>>,
    /// lowercased alias -> target, for names no provider table knows
    pub fallback_aliases: BTreeMap<String, String>,
    /// lowercased profile name (without the marker) -> profile
    pub profiles: BTreeMap<String, ProfileConfig>,
    pub generation: u64,
}

impl EffectiveConfig {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(&name.to_lowercase())
    }
}

/// Capability the rest of the gateway needs from configuration.
pub trait ConfigSource: Send + Sync {
    /// Current snapshot, loading it on first use.
    fn load(&self) -> Result<Arc<EffectiveConfig>>;
    /// Discard the snapshot, bump the generation and load afresh.
    fn reload(&self) -> Result<Arc<EffectiveConfig>>;
    /// Shared generation counter; cache entries stamped with an older value are stale.
    fn generation(&self) -> Arc<AtomicU64>;
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Tier {
    Bundled,
    File(PathBuf),
}

pub struct ConfigHierarchy {
    tiers: Vec<Tier>,
    env: HashMap<String, String>,
    cached: RwLock<Option<Arc<EffectiveConfig>>>,
    generation: Arc<AtomicU64>,
}

impl ConfigHierarchy {
    /// Bundled defaults followed by `files` (ascending precedence), with `env`
    /// standing in for the process environment.
    pub fn new(files: Vec<PathBuf>, env: HashMap<String, String>) -> Self {
        let mut tiers = vec![Tier::Bundled];
        tiers.extend(files.into_iter().map(Tier::File));
        Self {
            tiers,
            env,
            cached: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The standard tiers and the real process environment.
    pub fn from_process() -> Self {
        Self::new(config_search_paths(), std::env::vars().collect())
    }

    fn read_tiers(&self) -> toml::Value {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for tier in &self.tiers {
            let parsed = match tier {
                Tier::Bundled => toml::from_str::<toml::Value>(BUNDLED_DEFAULTS)
                    .map_err(GatewayError::from),
                Tier::File(path) if !path.exists() => continue,
                Tier::File(path) => read_toml(path),
            };

            match parsed {
                Ok(value) => {
                    if let Tier::File(path) = tier {
                        info!(path = %path.display(), "Loaded config tier");
                    }
                    merge_values(&mut merged, value);
                }
                Err(e) => {
                    warn!(tier = ?tier, error = %e, "Skipping unreadable config tier");
                }
            }
        }

        merged
    }

    fn build(&self) -> Result<EffectiveConfig> {
        let mut merged = self.read_tiers();
        let profile_sections = take_profile_sections(&mut merged);
        let file = match merged.try_into::<FileConfig>() {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Merged config has invalid types; using bundled defaults only");
                toml::from_str(BUNDLED_DEFAULTS)?
            }
        };
        let env = EnvView(&self.env);

        let defaults = &file.defaults;
        let global_timeout = env.parse::<u64>("REQUEST_TIMEOUT");
        let global_retries = env.parse::<u32>("MAX_RETRIES");

        // File-declared providers plus any introduced purely through the environment.
        let mut sections = file.providers.clone();
        for name in env.provider_names() {
            sections.entry(name).or_default();
        }

        let mut providers = BTreeMap::new();
        let mut keys = BTreeMap::new();
        let mut aliases = BTreeMap::new();

        for (name, section) in &sections {
            let prefix = env_prefix(name);

            let Some(base_url) = env
                .get(&format!("{prefix}_BASE_URL"))
                .or(section.base_url.clone())
            else {
                warn!(provider = %name, "Provider has no base URL; not registering");
                continue;
            };

            let format = env
                .get(&format!("{prefix}_API_FORMAT"))
                .or(section.api_format.clone())
                .unwrap_or_else(|| "openai".to_string());
            let dialect = Dialect::from_name(&format).ok_or_else(|| {
                GatewayError::config(format!(
                    "Provider '{name}' has unknown api-format '{format}' (expected openai or anthropic)"
                ))
            })?;

            let raw_keys = env
                .get(&format!("{prefix}_API_KEY"))
                .or_else(|| section.api_key_env.as_deref().and_then(|var| env.get(var)))
                .or(section.api_key.clone())
                .unwrap_or_default();
            let provider_keys: Vec<String> =
                raw_keys.split_whitespace().map(str::to_string).collect();
            let auth_mode_name = env
                .get(&format!("{prefix}_AUTH_MODE"))
                .or(section.auth_mode.clone());

            let Some(auth_mode) = decide_auth_mode(name, auth_mode_name.as_deref(), &provider_keys)?
            else {
                debug!(provider = %name, "No API key configured; not registering");
                continue;
            };

            let mut custom_headers = section.headers.clone();
            custom_headers.extend(env.prefixed(&format!("{prefix}_CUSTOM_HEADER_")));

            let timeout = global_timeout
                .or(section.timeout)
                .or(defaults.timeout)
                .unwrap_or(DEFAULT_TIMEOUT_SECS);
            let max_retries = global_retries
                .or(section.max_retries)
                .or(defaults.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES);

            let mut table: BTreeMap<String, String> = section
                .aliases
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect();
            table.extend(env.prefixed(&format!("{prefix}_ALIAS_")));

            if auth_mode != AuthMode::Passthrough {
                keys.insert(name.clone(), provider_keys);
            }
            aliases.insert(name.clone(), table);
            providers.insert(
                name.clone(),
                ProviderConfig {
                    name: name.clone(),
                    base_url: base_url.trim_end_matches('/').to_string(),
                    dialect,
                    auth_mode,
                    timeout: Duration::from_secs(timeout),
                    max_retries,
                    custom_headers,
                },
            );
        }

        if providers.is_empty() {
            return Err(GatewayError::config(
                "No provider is registered. Set <PROVIDER>_API_KEY or declare a provider with an api-key",
            ));
        }

        let requested = env
            .get("RELAY_DEFAULT_PROVIDER")
            .or(file.default_provider.clone());
        let default_provider = match requested {
            Some(name) if providers.contains_key(&name) => name,
            other => {
                // BTreeMap keys iterate in order, so this is the alphabetical first
                let first = providers.keys().next().cloned().unwrap_or_default();
                if let Some(name) = other {
                    warn!(requested = %name, using = %first, "Default provider is not registered");
                }
                first
            }
        };

        let strict_profiles = env
            .parse::<bool>("STRICT_PROFILE_VALIDATION")
            .or(defaults.strict_profile_validation)
            .unwrap_or(false);
        let declared_providers: BTreeSet<String> = sections.keys().cloned().collect();
        let profiles = build_profiles(
            profile_sections,
            &providers,
            &declared_providers,
            strict_profiles,
        )?;

        let server = ServerSettings {
            host: env
                .get("HOST")
                .or(file.server.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env
                .parse::<u16>("PORT")
                .or(file.server.port)
                .unwrap_or(DEFAULT_PORT),
            ledger_file: file.server.ledger_file.clone(),
        };

        Ok(EffectiveConfig {
            default_provider,
            server,
            alias_cache_ttl: Duration::from_secs(
                env.parse::<u64>("ALIAS_CACHE_TTL")
                    .or(defaults.alias_cache_ttl)
                    .unwrap_or(DEFAULT_ALIAS_CACHE_TTL_SECS),
            ),
            alias_cache_size: defaults.alias_cache_size.unwrap_or(DEFAULT_ALIAS_CACHE_SIZE),
            streaming_read_timeout: Duration::from_secs(
                env.parse::<u64>("STREAMING_READ_TIMEOUT")
                    .or(defaults.streaming_read_timeout)
                    .unwrap_or(DEFAULT_STREAMING_READ_TIMEOUT_SECS),
            ),
            providers,
            declared_providers,
            keys: KeyRing(keys),
            aliases,
            fallback_aliases: file
                .aliases
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            profiles,
            generation: self.generation.load(Ordering::SeqCst),
        })
    }
}

impl ConfigSource for ConfigHierarchy {
    fn load(&self) -> Result<Arc<EffectiveConfig>> {
        if let Ok(guard) = self.cached.read() {
            if let Some(config) = guard.as_ref() {
                return Ok(Arc::clone(config));
            }
        }

        let config = Arc::new(self.build()?);
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(Arc::clone(&config));
        }
        info!(
            providers = config.providers.len(),
            profiles = config.profiles.len(),
            default = %config.default_provider,
            generation = config.generation,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn reload(&self) -> Result<Arc<EffectiveConfig>> {
        if let Ok(mut guard) = self.cached.write() {
            *guard = None;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.load()
    }

    fn generation(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }
}

/// Decide the auth mode from the configured mode and keys. `Ok(None)` means
/// the provider has no usable credentials and is left out of the registry.
fn decide_auth_mode(
    provider: &str,
    mode: Option<&str>,
    keys: &[String],
) -> Result<Option<AuthMode>> {
    let has_sentinel = keys.iter().any(|k| k == PASSTHROUGH_SENTINEL);
    if has_sentinel && keys.len() > 1 {
        return Err(GatewayError::config(format!(
            "Provider '{provider}': '{PASSTHROUGH_SENTINEL}' cannot be combined with static keys"
        )));
    }

    match mode.map(|m| m.trim().to_ascii_lowercase()) {
        Some(m) if m == "passthrough" => {
            if !keys.is_empty() && !has_sentinel {
                return Err(GatewayError::config(format!(
                    "Provider '{provider}' uses auth-mode = \"passthrough\" but also has a static api-key"
                )));
            }
            Ok(Some(AuthMode::Passthrough))
        }
        Some(m) if m != "api-key" => Err(GatewayError::config(format!(
            "Provider '{provider}' has unknown auth-mode '{m}' (expected api-key or passthrough)"
        ))),
        _ if has_sentinel => Ok(Some(AuthMode::Passthrough)),
        _ => Ok(match keys.len() {
            0 => None,
            1 => Some(AuthMode::StaticSingle),
            _ => Some(AuthMode::StaticRotation),
        }),
    }
}

/// Remove every `#name` table from the merged document. Keys are lowercased
/// and stripped of the marker; a malformed profile is skipped with a warning.
fn take_profile_sections(merged: &mut toml::Value) -> BTreeMap<String, ProfileSection> {
    let mut sections = BTreeMap::new();
    let Some(table) = merged.as_table_mut() else {
        return sections;
    };

    let keys: Vec<String> = table
        .keys()
        .filter(|k| k.starts_with(PROFILE_MARKER))
        .cloned()
        .collect();
    for key in keys {
        let Some(value) = table.remove(&key) else {
            continue;
        };
        let name = key.trim_start_matches(PROFILE_MARKER).trim().to_lowercase();
        if name.is_empty() || name.contains(':') {
            warn!(profile = %key, "Ignoring profile with an unusable name");
            continue;
        }
        match value.try_into::<ProfileSection>() {
            Ok(section) => {
                sections.insert(name, section);
            }
            Err(e) => warn!(profile = %name, error = %e, "Skipping malformed profile"),
        }
    }
    sections
}

/// Validate profile aliases against the registered providers. Invalid
/// aliases fail the load when `strict`, otherwise they are dropped.
fn build_profiles(
    sections: BTreeMap<String, ProfileSection>,
    providers: &BTreeMap<String, ProviderConfig>,
    declared: &BTreeSet<String>,
    strict: bool,
) -> Result<BTreeMap<String, ProfileConfig>> {
    let mut profiles = BTreeMap::new();

    for (name, section) in sections {
        if declared.contains(&name) {
            warn!(profile = %name, "Profile shadows a provider of the same name; the profile wins");
        }

        let mut aliases = BTreeMap::new();
        for (alias, target) in section.aliases {
            let checked = match target.split_once(':') {
                None => Err("target has no provider prefix".to_string()),
                Some((_, model)) if model.trim().is_empty() => {
                    Err("target has an empty model".to_string())
                }
                Some((provider, _)) if !providers.contains_key(&provider.to_lowercase()) => {
                    Err(format!("provider '{provider}' is not registered"))
                }
                Some((provider, model)) => Ok(format!("{}:{}", provider.to_lowercase(), model)),
            };

            match checked {
                Ok(normalized) => {
                    aliases.insert(alias.to_lowercase(), normalized);
                }
                Err(problem) if strict => {
                    return Err(GatewayError::config(format!(
                        "Profile '{name}' alias '{alias}' -> '{target}': {problem}"
                    )));
                }
                Err(problem) => {
                    warn!(profile = %name, alias = %alias, target = %target, problem = %problem, "Dropping invalid profile alias");
                }
            }
        }

        profiles.insert(
            name.clone(),
            ProfileConfig {
                name,
                timeout: section.timeout.map(Duration::from_secs),
                max_retries: section.max_retries,
                aliases,
            },
        );
    }
    Ok(profiles)
}

/// Recursively overlay `overlay` onto `base`. Tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&content)?)
}

/// User tier then project tier.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("llm-relay").join("config.toml"));
    }
    paths.push(PathBuf::from(PROJECT_CONFIG_FILE));
    paths
}

fn env_prefix(provider: &str) -> String {
    provider.to_ascii_uppercase().replace('-', "_")
}

struct EnvView<'a>(&'a HashMap<String, String>);

impl EnvView<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = key, value = %raw, "Ignoring unparseable environment variable");
                None
            }
        }
    }

    /// `(suffix, value)` for every variable starting with `prefix`. The suffix
    /// is lowercased with underscores turned into hyphens.
    fn prefixed<'b>(&'b self, prefix: &'b str) -> impl Iterator<Item = (String, String)> + 'b {
        self.0.iter().filter_map(move |(k, v)| {
            let suffix = k.strip_prefix(prefix)?;
            if suffix.is_empty() {
                return None;
            }
            Some((suffix.to_ascii_lowercase().replace('_', "-"), v.trim().to_string()))
        })
    }

    /// Providers named by `<P>_API_KEY` or `<P>_BASE_URL`.
    fn provider_names(&self) -> Vec<String> {
        self.0
            .keys()
            .filter_map(|k| {
                k.strip_suffix("_API_KEY")
                    .or_else(|| k.strip_suffix("_BASE_URL"))
            })
            .filter(|p| !p.is_empty() && !p.contains("_CUSTOM_HEADER_") && !p.contains("_ALIAS_"))
            .map(|p| p.to_ascii_lowercase())
            .collect()
    }
}
