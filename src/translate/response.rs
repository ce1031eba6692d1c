use super::anthropic_types::{ErrorBody, ErrorResponse, MessagesResponse, ResponseContentBlock};
use super::anthropic_types::Usage as AnthropicUsage;
use super::canonical::{CanonicalResponse, ContentBlock, StopReason, Usage};
use super::openai_types::{
    ChatCompletionResponse, ChatErrorResponse, ChatToolCall, ChatToolCallFunction, ChatUsage,
    Choice, ChoiceMessage,
};
use super::request::{parse_arguments, render_arguments};
use super::Dialect;
use crate::error::{GatewayError, Result};

/// A non-streaming response body in one of the supported dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum WireResponse {
    OpenAi(ChatCompletionResponse),
    Anthropic(MessagesResponse),
}

impl WireResponse {
    /// Parse an upstream success body. A body that does not match the provider's
    /// dialect is a conversion failure, not a client error.
    pub fn parse(dialect: Dialect, body: &[u8]) -> Result<Self> {
        let parsed = match dialect {
            Dialect::OpenAi => serde_json::from_slice(body).map(WireResponse::OpenAi),
            Dialect::Anthropic => serde_json::from_slice(body).map(WireResponse::Anthropic),
        };
        parsed.map_err(|e| {
            GatewayError::conversion(format!("Unexpected {dialect} response body: {e}"))
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            WireResponse::OpenAi(r) => serde_json::to_value(r)?,
            WireResponse::Anthropic(r) => serde_json::to_value(r)?,
        })
    }
}

pub fn to_canonical_response(wire: &WireResponse) -> CanonicalResponse {
    match wire {
        WireResponse::OpenAi(resp) => openai_to_canonical(resp),
        WireResponse::Anthropic(resp) => anthropic_to_canonical(resp),
    }
}

pub fn from_canonical_response(resp: &CanonicalResponse, target: Dialect) -> WireResponse {
    match target {
        Dialect::OpenAi => WireResponse::OpenAi(canonical_to_openai(resp)),
        Dialect::Anthropic => WireResponse::Anthropic(canonical_to_anthropic(resp)),
    }
}

fn openai_to_canonical(resp: &ChatCompletionResponse) -> CanonicalResponse {
    let choice = resp.choices.first();
    let mut content = Vec::new();

    if let Some(c) = choice {
        if let Some(reasoning) = c.message.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                content.push(ContentBlock::Thinking {
                    text: reasoning.to_string(),
                    signature: None,
                });
            }
        }

        if let Some(text) = c.message.content.as_deref() {
            if !text.is_empty() {
                content.push(ContentBlock::Text(text.to_string()));
            }
        }

        for tc in c.message.tool_calls.iter().flatten() {
            content.push(ContentBlock::ToolUse {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                input: parse_arguments(&tc.function.arguments),
            });
        }
    }

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_read_input_tokens: None,
    });

    CanonicalResponse {
        id: resp.id.trim_start_matches("chatcmpl-").to_string(),
        model: resp.model.clone(),
        content,
        stop_reason: choice
            .and_then(|c| c.finish_reason.as_deref())
            .map(|r| StopReason::from_wire(Dialect::OpenAi, r)),
        stop_sequence: None,
        usage,
    }
}

fn anthropic_to_canonical(resp: &MessagesResponse) -> CanonicalResponse {
    let content = resp
        .content
        .iter()
        .map(|block| match block {
            ResponseContentBlock::Text { text } => ContentBlock::Text(text.clone()),
            ResponseContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            ResponseContentBlock::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                text: thinking.clone(),
                signature: signature.clone(),
            },
        })
        .collect();

    CanonicalResponse {
        id: resp.id.trim_start_matches("msg_").to_string(),
        model: resp.model.clone(),
        content,
        stop_reason: resp
            .stop_reason
            .as_deref()
            .map(|r| StopReason::from_wire(Dialect::Anthropic, r)),
        stop_sequence: resp.stop_sequence.clone(),
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_read_input_tokens: resp.usage.cache_read_input_tokens,
        },
    }
}

fn canonical_to_anthropic(resp: &CanonicalResponse) -> MessagesResponse {
    let mut content: Vec<ResponseContentBlock> = resp
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(ResponseContentBlock::Text { text: text.clone() }),
            ContentBlock::ToolUse { id, name, input } => Some(ResponseContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            ContentBlock::Thinking { text, signature } => Some(ResponseContentBlock::Thinking {
                thinking: text.clone(),
                signature: signature.clone(),
            }),
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => None,
        })
        .collect();

    // Anthropic clients expect non-empty content
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    MessagesResponse {
        id: format!("msg_{}", resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(
            resp.stop_reason
                .as_ref()
                .unwrap_or(&StopReason::EndTurn)
                .to_wire(Dialect::Anthropic),
        ),
        stop_sequence: resp.stop_sequence.clone(),
        usage: AnthropicUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: resp.usage.cache_read_input_tokens,
        },
    }
}

fn canonical_to_openai(resp: &CanonicalResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Text(t) => text.push_str(t),
            ContentBlock::Thinking { text: t, .. } => reasoning.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: render_arguments(input),
                },
            }),
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    let finish_reason = resp
        .stop_reason
        .as_ref()
        .unwrap_or(&StopReason::EndTurn)
        .to_wire(Dialect::OpenAi);

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp().max(0) as u64,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(ChatUsage::new(
            resp.usage.input_tokens,
            resp.usage.output_tokens,
        )),
    }
}

// ---------------------------------------------------------------------------
// Error envelopes
// ---------------------------------------------------------------------------

/// (openai `error.type`, envelope `error.type`)
const ERROR_TYPES: &[(&str, &str)] = &[
    ("invalid_request_error", "invalid_request_error"),
    ("authentication_error", "authentication_error"),
    ("permission_error", "permission_error"),
    ("not_found_error", "not_found_error"),
    ("rate_limit_error", "rate_limit_error"),
    ("rate_limit_exceeded", "rate_limit_error"),
    ("insufficient_quota", "rate_limit_error"),
    ("server_error", "api_error"),
    ("internal_error", "api_error"),
];

/// Translate an `OpenAI` error into the envelope used for every client error.
pub fn openai_error_to_envelope(err: &ChatErrorResponse) -> ErrorResponse {
    let error_type = ERROR_TYPES
        .iter()
        .find(|(openai, _)| *openai == err.error.error_type)
        .map_or("api_error", |(_, envelope)| *envelope);

    let mut body = ErrorBody::new(error_type, &err.error.message);
    body.code = err.error.code.as_ref().map(|c| match c {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    ErrorResponse::from_body(body)
}

/// Normalise an upstream error body from either dialect. The upstream status
/// decides the type whenever the body carries nothing recognisable.
pub fn upstream_error_envelope(status: u16, body: &[u8]) -> ErrorResponse {
    let mut envelope = if let Ok(anthropic) = serde_json::from_slice::<ErrorResponse>(body) {
        anthropic
    } else if let Ok(openai) = serde_json::from_slice::<ChatErrorResponse>(body) {
        openai_error_to_envelope(&openai)
    } else {
        let fallback = GatewayError::upstream_http(status, String::from_utf8_lossy(body));
        ErrorResponse::new(fallback.error_type(), String::from_utf8_lossy(body))
    };

    if envelope.error.error_type == "api_error" {
        envelope.error.error_type = GatewayError::upstream_http(status, "")
            .error_type()
            .to_string();
    }
    envelope.error.status = Some(status);
    envelope
}
