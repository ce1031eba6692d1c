//! Request orchestration: selection, authentication, translation, the upstream
//! call, and response translation or stream guarding.

use crate::alias::{AliasResolver, ModelResolver};
use crate::auth::{authenticate, peek_credential};
use crate::config::{ConfigSource, EffectiveConfig};
use crate::error::{GatewayError, Result};
use crate::metrics::{LifecycleEvent, MetricsSink};
use crate::models::{fetch_provider_models, truncate, ListedModel};
use crate::providers::{fingerprint, AuthMode, ClientFactory, ProviderConfig, ProviderRegistry};
use crate::selector::{Selection, Selector};
use crate::stream_guard::{guard_passthrough, guard_translated, CloseReporter, GuardedStream};
use crate::translate::canonical::{CanonicalRequest, ContentBlock, SystemPrompt, ToolOutput};
use crate::translate::response::upstream_error_envelope;
use crate::translate::{
    from_canonical, from_canonical_response, to_canonical, to_canonical_response, Dialect,
    RequestHead, StreamTranscoder, WireRequest, WireResponse,
};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client headers forwarded when request and provider share the Anthropic dialect.
pub const FORWARDED_HEADERS: &[&str] = &["anthropic-version", "anthropic-beta"];

/// One client request as the HTTP layer hands it over.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub dialect: Dialect,
    pub body: Bytes,
    pub client_key: Option<String>,
    pub headers: HeaderMap,
}

impl InboundRequest {
    pub fn new(dialect: Dialect, body: impl Into<Bytes>) -> Self {
        Self {
            dialect,
            body: body.into(),
            client_key: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }
}

pub enum GatewayResponse {
    Json { status: u16, body: Value },
    Stream(GuardedStream),
}

impl std::fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Everything known about one in-flight request.
struct RequestContext {
    request_id: String,
    client_dialect: Dialect,
    requested_model: String,
    provider: ProviderConfig,
    model: String,
    credential: String,
    streaming: bool,
    started: Instant,
}

impl RequestContext {
    fn same_dialect(&self) -> bool {
        self.client_dialect == self.provider.dialect
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Registry and settings of one configuration snapshot. Swapped whole on reload.
struct Runtime {
    config: Arc<EffectiveConfig>,
    registry: ProviderRegistry,
}

pub struct Gateway {
    config: Arc<dyn ConfigSource>,
    runtime: RwLock<Arc<Runtime>>,
    resolver: Arc<dyn ModelResolver>,
    metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    pub fn new(config: Arc<dyn ConfigSource>, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let effective = config.load()?;
        let resolver = Arc::new(AliasResolver::from_config(&effective, config.generation()));
        Self::with_resolver(config, resolver, metrics)
    }

    pub fn with_resolver(
        config: Arc<dyn ConfigSource>,
        resolver: Arc<dyn ModelResolver>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let effective = config.load()?;
        let registry = ProviderRegistry::from_config(&effective)?;
        Ok(Self {
            config,
            runtime: RwLock::new(Arc::new(Runtime {
                config: effective,
                registry,
            })),
            resolver,
            metrics,
        })
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .map(|r| Arc::clone(&r))
            .map_err(|_| GatewayError::config("Runtime state lock poisoned"))
    }

    pub fn effective_config(&self) -> Result<Arc<EffectiveConfig>> {
        Ok(Arc::clone(&self.runtime()?.config))
    }

    /// Selection for `model` and the provider settings in effect for it,
    /// with profile overrides applied.
    fn route(&self, runtime: &Runtime, model: &str) -> Result<(Selection, ProviderConfig)> {
        let selection = Selector::new(self.resolver.as_ref(), &runtime.registry).select(model)?;
        let mut provider = runtime.registry.get_provider(&selection.provider)?.clone();
        if let Some(profile) = selection
            .profile
            .as_deref()
            .and_then(|name| runtime.config.profile(name))
        {
            profile.apply(&mut provider);
        }
        Ok((selection, provider))
    }

    /// Serve one chat request end to end.
    pub async fn handle(&self, request: InboundRequest) -> Result<GatewayResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string();
        let head = RequestHead::parse(&request.body)?;
        let runtime = self.runtime()?;

        let (selection, provider) = self.route(&runtime, &head.model)?;
        let streaming = head.is_streaming();

        info!(
            request_id = %request_id,
            client = %request.dialect,
            requested = %head.model,
            provider = %provider.name,
            model = %selection.model,
            profile = selection.profile.as_deref().unwrap_or("-"),
            streaming,
            "Selected upstream"
        );
        self.metrics.record(
            &request_id,
            LifecycleEvent::SelectionComplete {
                provider: provider.name.clone(),
                model: selection.model.clone(),
                client_dialect: request.dialect,
                streaming,
            },
        );

        let credential =
            authenticate(&runtime.registry, &provider.name, request.client_key.as_deref())?;

        let ctx = RequestContext {
            request_id,
            client_dialect: request.dialect,
            requested_model: head.model,
            provider,
            model: selection.model,
            credential,
            streaming,
            started,
        };

        let body = if ctx.same_dialect() {
            passthrough_body(&request.body, &ctx.model)?
        } else {
            let wire = WireRequest::parse(request.dialect, &request.body)?;
            let mut canonical = to_canonical(&wire)?;
            canonical.model = ctx.model.clone();
            from_canonical(&canonical, ctx.provider.dialect).to_json()?
        };

        let forwarded = if ctx.same_dialect() && ctx.provider.dialect == Dialect::Anthropic {
            forwarded_headers(&request.headers)
        } else {
            HeaderMap::new()
        };

        let response = self
            .send(&runtime, &ctx, ctx.provider.dialect.chat_path(), &body, &forwarded)
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return self.upstream_error(&ctx, response).await;
        }

        if ctx.streaming {
            Ok(GatewayResponse::Stream(self.stream_response(&runtime, &ctx, response)))
        } else {
            self.json_response(&ctx, response).await
        }
    }

    /// Send `body` upstream. A 401/403 from a multi-key provider is retried
    /// once with the next key; nothing else is retried.
    async fn send(
        &self,
        runtime: &Runtime,
        ctx: &RequestContext,
        path: &str,
        body: &Value,
        forwarded: &HeaderMap,
    ) -> Result<reqwest::Response> {
        let mut credential = ctx.credential.clone();
        let mut attempt = 1;

        loop {
            let client = runtime.registry.client_for(&ctx.provider.name, &credential)?;
            self.metrics.record(
                &ctx.request_id,
                LifecycleEvent::UpstreamStart {
                    provider: ctx.provider.name.clone(),
                    attempt,
                },
            );
            debug!(request_id = %ctx.request_id, url = %client.url(path), attempt, key = %fingerprint(&credential), "POST upstream");

            let mut builder = client.post(path).headers(forwarded.clone()).json(body);
            if !ctx.streaming {
                builder = builder.timeout(ctx.provider.timeout);
            }

            let sent = if ctx.streaming {
                // Response headers must arrive within the idle window too; reads
                // after that are bounded by the stream guard.
                let idle = runtime.config.streaming_read_timeout;
                match tokio::time::timeout(idle, builder.send()).await {
                    Ok(result) => result.map_err(GatewayError::from_transport),
                    Err(_) => Err(GatewayError::upstream_timeout(format!(
                        "Provider '{}' sent no response within {}s",
                        ctx.provider.name,
                        idle.as_secs()
                    ))),
                }
            } else {
                builder.send().await.map_err(GatewayError::from_transport)
            };

            let response = match sent {
                Ok(r) => r,
                Err(err) => {
                    warn!(request_id = %ctx.request_id, provider = %ctx.provider.name, error = %err, "Upstream request failed");
                    self.metrics.record(
                        &ctx.request_id,
                        LifecycleEvent::UpstreamFailed {
                            status: err.status_code(),
                            error_type: err.error_type().to_string(),
                            message: err.to_string(),
                            duration_ms: ctx.elapsed_ms(),
                        },
                    );
                    return Err(err);
                }
            };

            let status = response.status().as_u16();
            let rejected = status == 401 || status == 403;
            if rejected && attempt == 1 && ctx.provider.auth_mode == AuthMode::StaticRotation {
                warn!(
                    request_id = %ctx.request_id,
                    provider = %ctx.provider.name,
                    status,
                    key = %fingerprint(&credential),
                    "Upstream rejected key; retrying with the next one"
                );
                credential = runtime.registry.next_key(&ctx.provider.name)?;
                attempt += 1;
                continue;
            }
            return Ok(response);
        }
    }

    async fn upstream_error(
        &self,
        ctx: &RequestContext,
        response: reqwest::Response,
    ) -> Result<GatewayResponse> {
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(GatewayError::from_transport)?;
        let envelope = upstream_error_envelope(status, &body);

        warn!(
            request_id = %ctx.request_id,
            provider = %ctx.provider.name,
            status,
            body = %truncate(&String::from_utf8_lossy(&body), 300),
            "Upstream returned an error"
        );
        self.metrics.record(
            &ctx.request_id,
            LifecycleEvent::UpstreamFailed {
                status,
                error_type: envelope.error.error_type.clone(),
                message: envelope.error.message.clone(),
                duration_ms: ctx.elapsed_ms(),
            },
        );

        Ok(GatewayResponse::Json {
            status,
            body: serde_json::to_value(&envelope)?,
        })
    }

    async fn json_response(
        &self,
        ctx: &RequestContext,
        response: reqwest::Response,
    ) -> Result<GatewayResponse> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(GatewayError::from_transport)?;
        let parsed = WireResponse::parse(ctx.provider.dialect, &bytes);

        let (body, usage) = if ctx.same_dialect() {
            let mut value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                GatewayError::conversion(format!(
                    "Provider '{}' returned invalid JSON: {e}. Body: {}",
                    ctx.provider.name,
                    truncate(&String::from_utf8_lossy(&bytes), 300)
                ))
            })?;
            if let Some(model) = value.get_mut("model") {
                *model = Value::String(ctx.requested_model.clone());
            }
            let usage = parsed.ok().map(|w| to_canonical_response(&w).usage);
            (value, usage)
        } else {
            let mut canonical = to_canonical_response(&parsed?);
            canonical.model = ctx.requested_model.clone();
            let usage = canonical.usage;
            (
                from_canonical_response(&canonical, ctx.client_dialect).to_json()?,
                Some(usage),
            )
        };

        let (input_tokens, output_tokens) =
            usage.map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
        info!(
            request_id = %ctx.request_id,
            input_tokens,
            output_tokens,
            duration_ms = ctx.elapsed_ms(),
            "Completed"
        );
        self.metrics.record(
            &ctx.request_id,
            LifecycleEvent::UpstreamComplete {
                status,
                input_tokens,
                output_tokens,
                duration_ms: ctx.elapsed_ms(),
            },
        );

        Ok(GatewayResponse::Json { status, body })
    }

    fn stream_response(
        &self,
        runtime: &Runtime,
        ctx: &RequestContext,
        response: reqwest::Response,
    ) -> GuardedStream {
        self.metrics.record(
            &ctx.request_id,
            LifecycleEvent::UpstreamComplete {
                status: response.status().as_u16(),
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: ctx.elapsed_ms(),
            },
        );

        let idle = runtime.config.streaming_read_timeout;
        let reporter = CloseReporter::new(&ctx.request_id, Arc::clone(&self.metrics), ctx.started);

        if ctx.same_dialect() {
            guard_passthrough(response.bytes_stream(), ctx.client_dialect, idle, reporter)
        } else {
            let transcoder = StreamTranscoder::new(
                ctx.provider.dialect,
                ctx.client_dialect,
                &ctx.requested_model,
            );
            guard_translated(response.bytes_stream(), transcoder, idle, reporter)
        }
    }

    /// Anthropic-style `count_tokens`. Forwarded to Anthropic-dialect providers,
    /// estimated at four characters per token for everything else.
    pub async fn count_tokens(
        &self,
        body: Bytes,
        client_key: Option<&str>,
    ) -> Result<GatewayResponse> {
        let head = RequestHead::parse(&body)?;
        let runtime = self.runtime()?;
        let (selection, provider) = self.route(&runtime, &head.model)?;

        if provider.dialect != Dialect::Anthropic {
            let wire = WireRequest::parse(Dialect::Anthropic, &body)?;
            let estimate = estimate_tokens(&to_canonical(&wire)?);
            debug!(provider = %provider.name, estimate, "Estimated token count");
            return Ok(GatewayResponse::Json {
                status: 200,
                body: json!({ "input_tokens": estimate }),
            });
        }

        let credential = authenticate(&runtime.registry, &provider.name, client_key)?;
        let ctx = RequestContext {
            request_id: Uuid::new_v4().simple().to_string(),
            client_dialect: Dialect::Anthropic,
            requested_model: head.model,
            provider,
            model: selection.model,
            credential,
            streaming: false,
            started: Instant::now(),
        };
        let body = passthrough_body(&body, &ctx.model)?;
        let response = self
            .send(&runtime, &ctx, "/v1/messages/count_tokens", &body, &HeaderMap::new())
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return self.upstream_error(&ctx, response).await;
        }
        let bytes = response.bytes().await.map_err(GatewayError::from_transport)?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::conversion(format!("Invalid count_tokens response: {e}")))?;
        Ok(GatewayResponse::Json { status, body: value })
    }

    /// Models served by every registered provider. A provider that fails to
    /// answer is logged and left out.
    pub async fn list_models(&self, client_key: Option<&str>) -> Result<Vec<ListedModel>> {
        let runtime = self.runtime()?;

        let clients: Vec<_> = runtime
            .registry
            .names()
            .filter_map(|name| {
                let credential = peek_credential(&runtime.registry, name, client_key).ok()?;
                runtime.registry.client_for(name, &credential).ok()
            })
            .collect();

        let results =
            futures::future::join_all(clients.iter().map(fetch_provider_models)).await;

        let mut models = Vec::new();
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(listed) => models.extend(listed),
                Err(e) => warn!(provider = %client.provider(), error = %e, "Could not list models"),
            }
        }
        Ok(models)
    }

    /// Registered providers and the alias tables currently in effect.
    pub fn list_aliases(&self) -> Result<Value> {
        let runtime = self.runtime()?;
        let table = self.resolver.snapshot();

        let providers: serde_json::Map<String, Value> = runtime
            .registry
            .providers()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({
                        "base_url": p.base_url,
                        "api_format": p.dialect,
                        "auth_mode": p.auth_mode,
                        "timeout": p.timeout.as_secs(),
                        "max_retries": p.max_retries,
                        "keys": runtime.registry.key_count(&p.name),
                    }),
                )
            })
            .collect();

        Ok(json!({
            "default_provider": runtime.registry.default_provider(),
            "providers": providers,
            "aliases": table.provider_aliases(),
            "fallback_aliases": table.fallback_aliases(),
            "profiles": runtime.config.profiles,
        }))
    }

    /// Reload configuration, rebuild the registry and refresh alias tables.
    /// On failure the previous runtime stays in place.
    pub fn reload(&self) -> Result<Value> {
        let config = self.config.reload()?;
        let registry = ProviderRegistry::from_config(&config)?;
        self.resolver.refresh(&config);

        let providers: Vec<String> = registry.names().map(str::to_string).collect();
        let generation = config.generation;
        let runtime = Arc::new(Runtime { config, registry });
        match self.runtime.write() {
            Ok(mut guard) => *guard = runtime,
            Err(_) => return Err(GatewayError::config("Runtime state lock poisoned")),
        }

        info!(generation, providers = ?providers, "Configuration reloaded");
        Ok(json!({ "generation": generation, "providers": providers }))
    }
}

/// Client body with only `model` rewritten; every other field reaches the
/// provider untouched.
fn passthrough_body(body: &[u8], model: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert("model".to_string(), Value::String(model.to_string()));
            Ok(value)
        }
        None => Err(GatewayError::invalid_request("Request body must be a JSON object")),
    }
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name) {
            if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) {
                out.insert(name, value.clone());
            }
        }
    }
    out
}

/// Rough token estimate: one token per four characters of prompt text.
pub fn estimate_tokens(request: &CanonicalRequest) -> u64 {
    fn block_chars(block: &ContentBlock) -> usize {
        match block {
            ContentBlock::Text(text) => text.chars().count(),
            ContentBlock::Image { .. } => 0,
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => match content {
                Some(ToolOutput::Text(text)) => text.chars().count(),
                Some(ToolOutput::Blocks(blocks)) => blocks.iter().map(block_chars).sum(),
                None => 0,
            },
            ContentBlock::Thinking { text, .. } => text.chars().count(),
        }
    }

    let system = match &request.system {
        Some(SystemPrompt::Text(text)) => text.chars().count(),
        Some(SystemPrompt::Blocks(blocks)) => blocks.iter().map(|b| b.text.chars().count()).sum(),
        None => 0,
    };
    let messages: usize = request
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(block_chars)
        .sum();
    let tools: usize = request.tools.iter().flatten().map(|t| {
        t.name.len() + t.description.as_ref().map_or(0, String::len) + t.parameters.to_string().len()
    }).sum();

    let chars = (system + messages + tools) as u64;
    chars.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{GenerationParams, Message, Role};

    #[test]
    fn test_passthrough_body_rewrites_only_model() {
        let body = br#"{"model":"haiku","messages":[],"custom_flag":{"x":1}}"#;
        let value = passthrough_body(body, "gpt-4o-mini").unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["custom_flag"]["x"], 1);
    }

    #[test]
    fn test_passthrough_body_must_be_object() {
        assert!(matches!(
            passthrough_body(b"[1,2]", "m"),
            Err(GatewayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_forwarded_headers_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());
        headers.insert("anthropic-beta", "tools-2024".parse().unwrap());
        headers.insert("cookie", "secret".parse().unwrap());
        let out = forwarded_headers(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.get("cookie").is_none());
    }

    #[test]
    fn test_estimate_tokens() {
        let request = CanonicalRequest {
            model: "m".into(),
            system: Some(SystemPrompt::Text("abcd".into())),
            messages: vec![Message::new(
                Role::User,
                vec![ContentBlock::Text("abcdefgh".into())],
            )],
            params: GenerationParams::default(),
            tools: None,
            tool_choice: None,
            stream: None,
            extensions: None,
        };
        // 12 chars
        assert_eq!(estimate_tokens(&request), 3);
    }
}
