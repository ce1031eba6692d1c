//! Picks the provider and concrete model for a client-supplied model string.

use crate::alias::{ModelResolver, LITERAL_PREFIX};
use crate::error::{GatewayError, Result};
use crate::providers::ProviderRegistry;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    /// Profile named by the model string, if any.
    pub profile: Option<String>,
}

pub struct Selector<'a> {
    resolver: &'a dyn ModelResolver,
    registry: &'a ProviderRegistry,
}

impl<'a> Selector<'a> {
    pub fn new(resolver: &'a dyn ModelResolver, registry: &'a ProviderRegistry) -> Self {
        Self { resolver, registry }
    }

    /// A `profile:` prefix is tried first: a profile alias routes to its
    /// `provider:model` target, anything else falls through with the prefix
    /// removed. Then provider precedence: explicit `provider:` prefix, the
    /// provider whose alias table defines the name, the default provider.
    pub fn select(&self, raw_model: &str) -> Result<Selection> {
        let raw = raw_model.trim();
        let Some((profile, name)) = self.resolver.split_profile(raw) else {
            return self.select_provider(raw);
        };

        let mut selection = match self.resolver.profile_target(&profile, &name) {
            Some(target) => self.profile_target(&target)?,
            None => self.select_provider(&name)?,
        };
        debug!(raw = %raw, profile = %profile, provider = %selection.provider, model = %selection.model, "Selected through profile");
        selection.profile = Some(profile);
        Ok(selection)
    }

    fn profile_target(&self, target: &str) -> Result<Selection> {
        let Some((provider, model)) = target.split_once(':') else {
            return Err(GatewayError::unknown_model(format!(
                "profile alias target '{target}' has no provider"
            )));
        };
        if !self.registry.is_registered(provider) {
            return Err(GatewayError::unknown_provider(provider));
        }
        Ok(Selection {
            provider: provider.to_string(),
            model: model.to_string(),
            profile: None,
        })
    }

    fn select_provider(&self, raw: &str) -> Result<Selection> {
        let (explicit, name) = self.resolver.split_provider(raw);
        if name.trim().is_empty() {
            return Err(GatewayError::unknown_model("request does not name a model"));
        }

        let provider = match explicit {
            Some(p) => p.to_lowercase(),
            None => self
                .resolver
                .owner_of(&name)
                .unwrap_or_else(|| self.registry.default_provider().to_string()),
        };
        if !self.registry.is_registered(&provider) {
            return Err(GatewayError::unknown_provider(provider));
        }

        let resolved = self.resolver.resolve(raw, Some(&provider));
        let selection = if !name.starts_with(LITERAL_PREFIX) && resolved != name {
            self.reroute(provider, resolved)
        } else {
            Selection {
                provider,
                model: resolved,
                profile: None,
            }
        };

        if selection.model.trim().is_empty() {
            return Err(GatewayError::unknown_model(format!(
                "'{raw}' resolves to an empty model name"
            )));
        }
        debug!(raw = %raw, provider = %selection.provider, model = %selection.model, "Selected model");
        Ok(selection)
    }

    /// An alias target of the form `other:model` moves the request to `other`.
    fn reroute(&self, provider: String, resolved: String) -> Selection {
        match resolved.split_once(':') {
            Some((other, model)) if self.registry.is_registered(other) => Selection {
                provider: other.to_string(),
                model: model.to_string(),
                profile: None,
            },
            _ => Selection {
                provider,
                model: resolved,
                profile: None,
            },
        }
    }
}
