//! Upstream model discovery.
//!
//! Both dialects answer a `GET .../models` with `{"data": [{"id": ...}, ...]}`;
//! only the path differs.

use crate::error::{GatewayError, Result};
use crate::providers::UpstreamClient;
use crate::translate::Dialect;
use serde::{Deserialize, Serialize};

/// An entry of a provider's `/models` listing.
#[derive(Debug, Deserialize)]
pub struct ProviderModel {
    pub id: String,
    pub owned_by: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderModelsResponse {
    pub data: Vec<ProviderModel>,
}

/// One model in the gateway's aggregated `/v1/models` listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedModel {
    /// `provider:model`, directly usable as a request's `model`.
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn models_path(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::OpenAi => "/models",
        Dialect::Anthropic => "/v1/models",
    }
}

/// Fetch the models a provider currently serves.
///
/// # Errors
/// `UpstreamHttp` for an error status, `Conversion` for an unparseable body.
pub async fn fetch_provider_models(client: &UpstreamClient) -> Result<Vec<ListedModel>> {
    let response = client
        .get(models_path(client.dialect()))
        .timeout(client.timeout())
        .send()
        .await
        .map_err(GatewayError::from_transport)?;

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::upstream_http(
            status,
            format!(
                "Provider '{}' returned status {status} when listing models: {}",
                client.provider(),
                truncate(&body, 300)
            ),
        ));
    }

    let body = response.bytes().await.map_err(GatewayError::from_transport)?;
    let parsed: ProviderModelsResponse = serde_json::from_slice(&body).map_err(|e| {
        GatewayError::conversion(format!(
            "Failed to parse models response from '{}': {e}",
            client.provider()
        ))
    })?;

    Ok(parsed
        .data
        .into_iter()
        .map(|m| ListedModel {
            id: format!("{}:{}", client.provider(), m.id),
            object: "model",
            owned_by: m.owned_by.unwrap_or_else(|| client.provider().to_string()),
            display_name: m.display_name,
        })
        .collect())
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_path_per_dialect() {
        assert_eq!(models_path(Dialect::OpenAi), "/models");
        assert_eq!(models_path(Dialect::Anthropic), "/v1/models");
    }

    #[test]
    fn test_parse_anthropic_listing() {
        let body = r#"{"data":[{"id":"claude-sonnet-4-5","type":"model","display_name":"Claude Sonnet 4.5"}],"has_more":false}"#;
        let parsed: ProviderModelsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data[0].id, "claude-sonnet-4-5");
        assert_eq!(parsed.data[0].display_name.as_deref(), Some("Claude Sonnet 4.5"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
