//! Model alias resolution with a generation-stamped cache.

use crate::config::EffectiveConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Prefix marking a model name that must reach the provider verbatim.
pub const LITERAL_PREFIX: char = '!';

/// Alias tables for every provider plus the provider-less fallback table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AliasTable {
    /// Configuration generation the table was built from.
    #[serde(skip)]
    generation: u64,
    default_provider: String,
    providers: BTreeSet<String>,
    by_provider: BTreeMap<String, BTreeMap<String, String>>,
    fallback: BTreeMap<String, String>,
    /// profile -> lowercased alias -> `provider:model`
    profiles: BTreeMap<String, BTreeMap<String, String>>,
}

impl AliasTable {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            default_provider: default_provider.into(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &EffectiveConfig) -> Self {
        let mut table = Self::new(config.default_provider.clone());
        table.generation = config.generation;
        table.providers = config.declared_providers.clone();
        for (provider, aliases) in &config.aliases {
            table.providers.insert(provider.clone());
            for (alias, target) in aliases {
                table.insert(provider, alias, target);
            }
        }
        for (alias, target) in &config.fallback_aliases {
            table.insert_fallback(alias, target);
        }
        for (name, profile) in &config.profiles {
            table.profiles.insert(name.clone(), profile.aliases.clone());
        }
        table
    }

    /// Keys are lowercased on insert.
    pub fn insert(&mut self, provider: &str, alias: &str, target: &str) {
        self.providers.insert(provider.to_string());
        self.by_provider
            .entry(provider.to_string())
            .or_default()
            .insert(alias.to_lowercase(), target.to_string());
    }

    pub fn insert_fallback(&mut self, alias: &str, target: &str) {
        self.fallback
            .insert(alias.to_lowercase(), target.to_string());
    }

    pub fn lookup(&self, provider: &str, name: &str) -> Option<&str> {
        self.by_provider
            .get(provider)?
            .get(&name.to_lowercase())
            .map(String::as_str)
    }

    pub fn lookup_fallback(&self, name: &str) -> Option<&str> {
        self.fallback.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn insert_profile_alias(&mut self, profile: &str, alias: &str, target: &str) {
        self.profiles
            .entry(profile.to_lowercase())
            .or_default()
            .insert(alias.to_lowercase(), target.to_string());
    }

    pub fn lookup_profile(&self, profile: &str, name: &str) -> Option<&str> {
        self.profiles
            .get(&profile.to_lowercase())?
            .get(&name.to_lowercase())
            .map(String::as_str)
    }

    /// Split `profile:rest` when the prefix names a profile. Checked before
    /// provider prefixes, so a profile shadows a provider of the same name.
    pub fn split_profile<'a>(&self, raw: &'a str) -> Option<(&'a str, &'a str)> {
        raw.split_once(':')
            .filter(|(prefix, _)| self.profiles.contains_key(&prefix.to_lowercase()))
    }

    /// Provider whose table defines `name`: the default provider if it does,
    /// otherwise the alphabetically first.
    pub fn owner_of(&self, name: &str) -> Option<&str> {
        let key = name.to_lowercase();
        if self
            .by_provider
            .get(&self.default_provider)
            .is_some_and(|t| t.contains_key(&key))
        {
            return Some(self.default_provider.as_str());
        }
        self.by_provider
            .iter()
            .find(|(_, table)| table.contains_key(&key))
            .map(|(provider, _)| provider.as_str())
    }

    /// Split `provider:model` when the prefix names a known provider.
    pub fn split_provider<'a>(&self, raw: &'a str) -> (Option<&'a str>, &'a str) {
        match raw.split_once(':') {
            Some((prefix, rest)) if self.providers.contains(&prefix.to_lowercase()) => {
                (Some(prefix), rest)
            }
            _ => (None, raw),
        }
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn provider_aliases(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.by_provider
    }

    pub fn fallback_aliases(&self) -> &BTreeMap<String, String> {
        &self.fallback
    }

    pub fn profile_aliases(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.profiles
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider: String,
    name: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    model: String,
    created: Instant,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Bounded resolution cache. An entry is valid only while its generation
/// matches the shared counter and it is younger than the TTL.
#[derive(Debug)]
pub struct AliasCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
    generation: Arc<AtomicU64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AliasCache {
    pub fn new(ttl: Duration, max_size: usize, generation: Arc<AtomicU64>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size: max_size.max(1),
            generation,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<String> {
        let current = self.generation.load(Ordering::SeqCst);
        let found = self.entries.read().ok().and_then(|entries| {
            entries
                .get(key)
                .filter(|e| e.generation == current && e.created.elapsed() < self.ttl)
                .map(|e| e.model.clone())
        });

        match found {
            Some(model) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(model)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// `generation` is that of the table the model was looked up in, so a
    /// lookup racing a reload is stale as soon as the counter moves.
    fn insert(&self, key: CacheKey, model: String, generation: u64) {
        let entry = CacheEntry {
            model,
            created: Instant::now(),
            generation,
        };
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, entry);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.read().map(|e| e.len()).unwrap_or(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// What the selector needs from alias resolution.
pub trait ModelResolver: Send + Sync {
    /// Concrete model for `raw_model`, or `raw_model` itself if nothing maps it.
    fn resolve(&self, raw_model: &str, provider_hint: Option<&str>) -> String;

    /// `(explicit provider, remaining model name)` for a raw model string.
    fn split_provider(&self, raw_model: &str) -> (Option<String>, String);

    fn owner_of(&self, alias: &str) -> Option<String>;

    /// `(lowercased profile, remaining model name)` when the prefix names a profile.
    fn split_profile(&self, raw_model: &str) -> Option<(String, String)>;

    /// `provider:model` target of `alias` within `profile`.
    fn profile_target(&self, profile: &str, alias: &str) -> Option<String>;

    /// Swap in the tables of a freshly loaded configuration.
    fn refresh(&self, config: &EffectiveConfig);

    fn snapshot(&self) -> Arc<AliasTable>;
}

pub struct AliasResolver {
    table: RwLock<Arc<AliasTable>>,
    cache: AliasCache,
    lookups: AtomicU64,
}

impl AliasResolver {
    pub fn new(table: AliasTable, cache: AliasCache) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
            cache,
            lookups: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EffectiveConfig, generation: Arc<AtomicU64>) -> Self {
        Self::new(
            AliasTable::from_config(config),
            AliasCache::new(config.alias_cache_ttl, config.alias_cache_size, generation),
        )
    }

    /// Number of times resolution had to consult the tables.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn table(&self) -> Arc<AliasTable> {
        self.table
            .read()
            .map(|t| Arc::clone(&t))
            .unwrap_or_default()
    }

    fn lookup(&self, table: &AliasTable, provider: &str, name: &str) -> String {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        table
            .lookup(provider, name)
            .or_else(|| table.lookup_fallback(name))
            .unwrap_or(name)
            .to_string()
    }
}

impl ModelResolver for AliasResolver {
    fn resolve(&self, raw_model: &str, provider_hint: Option<&str>) -> String {
        let table = self.table();
        let (explicit, name) = table.split_provider(raw_model);

        if let Some(literal) = name.strip_prefix(LITERAL_PREFIX) {
            return literal.to_string();
        }

        let provider = explicit
            .map(str::to_lowercase)
            .or_else(|| provider_hint.map(str::to_string))
            .unwrap_or_else(|| table.default_provider().to_string());

        // exact spelling: unmatched names pass through with their original case
        let key = CacheKey {
            provider,
            name: name.to_string(),
        };
        if let Some(model) = self.cache.get(&key) {
            return model;
        }

        let model = self.lookup(&table, &key.provider, name);
        debug!(provider = %key.provider, alias = %name, model = %model, "Resolved model alias");
        self.cache.insert(key, model.clone(), table.generation);
        model
    }

    fn split_provider(&self, raw_model: &str) -> (Option<String>, String) {
        let (provider, name) = self.table().split_provider(raw_model);
        (provider.map(str::to_lowercase), name.to_string())
    }

    fn owner_of(&self, alias: &str) -> Option<String> {
        self.table().owner_of(alias).map(str::to_string)
    }

    fn split_profile(&self, raw_model: &str) -> Option<(String, String)> {
        self.table()
            .split_profile(raw_model)
            .map(|(profile, rest)| (profile.to_lowercase(), rest.to_string()))
    }

    fn profile_target(&self, profile: &str, alias: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.table()
            .lookup_profile(profile, alias)
            .map(str::to_string)
    }

    fn refresh(&self, config: &EffectiveConfig) {
        if let Ok(mut table) = self.table.write() {
            *table = Arc::new(AliasTable::from_config(config));
        }
    }

    fn snapshot(&self) -> Arc<AliasTable> {
        self.table()
    }
}
