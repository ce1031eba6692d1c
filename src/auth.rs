//! Chooses the credential sent upstream for one request.

use crate::error::{GatewayError, Result};
use crate::providers::{AuthMode, ProviderRegistry};

/// Credential for `provider`. Static providers draw from their key pool and
/// ignore the client's key; passthrough providers forward the client's key.
pub fn authenticate(
    registry: &ProviderRegistry,
    provider: &str,
    client_key: Option<&str>,
) -> Result<String> {
    credential(registry, provider, client_key, ProviderRegistry::next_key)
}

/// Like [`authenticate`] but without advancing key rotation, for side
/// requests such as model listing.
pub fn peek_credential(
    registry: &ProviderRegistry,
    provider: &str,
    client_key: Option<&str>,
) -> Result<String> {
    credential(registry, provider, client_key, ProviderRegistry::peek_key)
}

fn credential(
    registry: &ProviderRegistry,
    provider: &str,
    client_key: Option<&str>,
    draw: fn(&ProviderRegistry, &str) -> Result<String>,
) -> Result<String> {
    match registry.get_provider(provider)?.auth_mode {
        AuthMode::StaticSingle | AuthMode::StaticRotation => draw(registry, provider),
        AuthMode::Passthrough => client_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::auth(provider)),
    }
}

/// Extract a client credential from `x-api-key` or `Authorization: Bearer`.
pub fn client_key_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|k| k.trim().to_string())
}
