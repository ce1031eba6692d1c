//! Translate requests between a wire dialect and the canonical form.
//!
//! Handles system prompts, multi-part content (text, images), tool use, tool
//! results, and tool choice mapping. A single canonical user message can expand
//! into multiple `OpenAI` messages (tool results become separate `tool`-role
//! messages), and consecutive `OpenAI` tool messages fold back into one.

use serde::Deserialize;
use serde_json::Value;

use super::anthropic_types::{
    self as anthropic, ContentBlock as AnthropicBlock, MessageContent, MessagesRequest,
    SystemBlock, SystemContent, ToolResultContent,
};
use super::canonical::{
    CanonicalRequest, ContentBlock, Extensions, GenerationParams, ImageSource, InstructionRole,
    Message, Role, SystemEntry, SystemPrompt, Tool, ToolChoice, ToolOutput, DEFAULT_MAX_TOKENS,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart, ImageUrlDetail, StopSpec, StreamOptions,
};
use super::Dialect;
use crate::error::{GatewayError, Result};

const STREAM_OPTIONS: &str = "stream_options";

/// A request body in one of the supported dialects.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRequest {
    OpenAi(ChatCompletionRequest),
    Anthropic(MessagesRequest),
}

impl WireRequest {
    /// Parse a client body according to the dialect of the endpoint it arrived on.
    pub fn parse(dialect: Dialect, body: &[u8]) -> Result<Self> {
        let parsed = match dialect {
            Dialect::OpenAi => serde_json::from_slice(body).map(WireRequest::OpenAi),
            Dialect::Anthropic => serde_json::from_slice(body).map(WireRequest::Anthropic),
        };
        parsed.map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            WireRequest::OpenAi(_) => Dialect::OpenAi,
            WireRequest::Anthropic(_) => Dialect::Anthropic,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            WireRequest::OpenAi(r) => &r.model,
            WireRequest::Anthropic(r) => &r.model,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            WireRequest::OpenAi(r) => r.stream.unwrap_or(false),
            WireRequest::Anthropic(r) => r.stream.unwrap_or(false),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            WireRequest::OpenAi(r) => serde_json::to_value(r)?,
            WireRequest::Anthropic(r) => serde_json::to_value(r)?,
        })
    }
}

/// The two fields routing needs, read without validating the rest of the body.
/// Same-dialect requests are forwarded as sent, so content the typed wire
/// structs do not model must not be rejected here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestHead {
    pub model: String,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl RequestHead {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| GatewayError::invalid_request(format!("Invalid request body: {e}")))
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Convert a wire request into the canonical form.
pub fn to_canonical(wire: &WireRequest) -> Result<CanonicalRequest> {
    match wire {
        WireRequest::Anthropic(req) => Ok(anthropic_to_canonical(req)),
        WireRequest::OpenAi(req) => openai_to_canonical(req),
    }
}

/// Render a canonical request in the target dialect.
pub fn from_canonical(req: &CanonicalRequest, target: Dialect) -> WireRequest {
    match target {
        Dialect::Anthropic => WireRequest::Anthropic(canonical_to_anthropic(req)),
        Dialect::OpenAi => WireRequest::OpenAi(canonical_to_openai(req)),
    }
}

// ---------------------------------------------------------------------------
// Anthropic <-> canonical
// ---------------------------------------------------------------------------

fn anthropic_to_canonical(req: &MessagesRequest) -> CanonicalRequest {
    let system = req.system.as_ref().map(|s| match s {
        SystemContent::Text(t) => SystemPrompt::Text(t.clone()),
        SystemContent::Blocks(blocks) => SystemPrompt::Blocks(
            blocks
                .iter()
                .map(|b| match b {
                    SystemBlock::Text { text } => SystemEntry::system(text.clone()),
                })
                .collect(),
        ),
    });

    let messages = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                anthropic::Role::User => Role::User,
                anthropic::Role::Assistant => Role::Assistant,
            };
            Message::new(role, m.content.blocks().iter().map(block_from_anthropic).collect())
        })
        .collect();

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| Tool {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        anthropic::ToolChoice::Auto => ToolChoice::Auto,
        anthropic::ToolChoice::Any => ToolChoice::Any,
        anthropic::ToolChoice::None => ToolChoice::None,
        anthropic::ToolChoice::Tool { name } => ToolChoice::Tool(name.clone()),
    });

    CanonicalRequest {
        model: req.model.clone(),
        system,
        messages,
        params: GenerationParams {
            max_tokens: Some(req.max_tokens),
            max_completion_tokens: None,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop: req.stop_sequences.clone(),
            user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
        },
        tools,
        tool_choice,
        stream: req.stream,
        extensions: Extensions::from_fields(Dialect::Anthropic, req.extra.clone()),
    }
}

fn block_from_anthropic(block: &AnthropicBlock) -> ContentBlock {
    match block {
        AnthropicBlock::Text { text } => ContentBlock::Text(text.clone()),
        AnthropicBlock::Image { source } => ContentBlock::Image {
            source: match source {
                anthropic::ImageSource::Base64 { media_type, data } => ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                anthropic::ImageSource::Url { url } => ImageSource::Url(url.clone()),
            },
            detail: None,
        },
        AnthropicBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        AnthropicBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.as_ref().map(|c| match c {
                ToolResultContent::Text(t) => ToolOutput::Text(t.clone()),
                ToolResultContent::Blocks(blocks) => {
                    ToolOutput::Blocks(blocks.iter().map(block_from_anthropic).collect())
                }
            }),
            is_error: *is_error,
        },
        AnthropicBlock::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            text: thinking.clone(),
            signature: signature.clone(),
        },
    }
}

fn canonical_to_anthropic(req: &CanonicalRequest) -> MessagesRequest {
    let system = req.system.as_ref().map(|s| match s {
        SystemPrompt::Text(t) => SystemContent::Text(t.clone()),
        SystemPrompt::Blocks(blocks) => SystemContent::Blocks(
            blocks
                .iter()
                .map(|entry| SystemBlock::Text {
                    text: entry.text.clone(),
                })
                .collect(),
        ),
    });

    // Anthropic requires alternating roles, so adjacent same-role messages merge.
    let mut messages: Vec<anthropic::Message> = Vec::new();
    for msg in &req.messages {
        let role = match msg.role {
            Role::User => anthropic::Role::User,
            Role::Assistant => anthropic::Role::Assistant,
        };
        let blocks: Vec<AnthropicBlock> = msg.content.iter().map(block_to_anthropic).collect();

        match messages.last_mut() {
            Some(prev) if prev.role == role => {
                let mut merged = prev.content.blocks();
                merged.extend(blocks);
                prev.content = MessageContent::Blocks(merged);
            }
            _ => messages.push(anthropic::Message {
                role,
                content: collapse_anthropic_blocks(blocks),
            }),
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| anthropic::Tool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoice::Auto => anthropic::ToolChoice::Auto,
        ToolChoice::Any => anthropic::ToolChoice::Any,
        ToolChoice::None => anthropic::ToolChoice::None,
        ToolChoice::Tool(name) => anthropic::ToolChoice::Tool { name: name.clone() },
    });

    MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.params.output_limit().unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        stream: req.stream,
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        top_k: req.params.top_k,
        tools,
        tool_choice,
        metadata: req.params.user.as_ref().map(|u| anthropic::Metadata {
            user_id: Some(u.clone()),
        }),
        stop_sequences: req.params.stop.clone(),
        extra: req.extensions_for(Dialect::Anthropic),
    }
}

fn collapse_anthropic_blocks(blocks: Vec<AnthropicBlock>) -> MessageContent {
    if let [AnthropicBlock::Text { text }] = blocks.as_slice() {
        return MessageContent::Text(text.clone());
    }
    MessageContent::Blocks(blocks)
}

fn block_to_anthropic(block: &ContentBlock) -> AnthropicBlock {
    match block {
        ContentBlock::Text(text) => AnthropicBlock::Text { text: text.clone() },
        ContentBlock::Image { source, .. } => AnthropicBlock::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => anthropic::ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url(url) => anthropic::ImageSource::Url { url: url.clone() },
            },
        },
        ContentBlock::ToolUse { id, name, input } => AnthropicBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => AnthropicBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.as_ref().map(|c| match c {
                ToolOutput::Text(t) => ToolResultContent::Text(t.clone()),
                ToolOutput::Blocks(blocks) => {
                    ToolResultContent::Blocks(blocks.iter().map(block_to_anthropic).collect())
                }
            }),
            is_error: *is_error,
        },
        ContentBlock::Thinking { text, signature } => AnthropicBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// OpenAI <-> canonical
// ---------------------------------------------------------------------------

fn openai_to_canonical(req: &ChatCompletionRequest) -> Result<CanonicalRequest> {
    let mut system_parts: Vec<SystemEntry> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();
    let mut in_tool_run = false;

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                system_parts.push(SystemEntry {
                    text: msg.content.as_ref().map(ChatContent::text).unwrap_or_default(),
                    role: if msg.role == "developer" {
                        InstructionRole::Developer
                    } else {
                        InstructionRole::System
                    },
                });
                in_tool_run = false;
            }
            "user" => {
                let mut message = Message::new(Role::User, user_blocks_from_openai(msg.content.as_ref()));
                message.name = msg.name.clone();
                messages.push(message);
                in_tool_run = false;
            }
            "assistant" => {
                let mut message = Message::new(Role::Assistant, assistant_blocks_from_openai(msg));
                message.name = msg.name.clone();
                messages.push(message);
                in_tool_run = false;
            }
            "tool" | "function" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: msg
                        .tool_call_id
                        .clone()
                        .or_else(|| msg.name.clone())
                        .unwrap_or_default(),
                    content: Some(ToolOutput::Text(
                        msg.content.as_ref().map(ChatContent::text).unwrap_or_default(),
                    )),
                    is_error: None,
                };
                match messages.last_mut() {
                    Some(prev) if in_tool_run => prev.content.push(block),
                    _ => messages.push(Message::new(Role::User, vec![block])),
                }
                in_tool_run = true;
            }
            other => {
                return Err(GatewayError::invalid_request(format!(
                    "Unsupported message role '{other}'"
                )));
            }
        }
    }

    let system = match system_parts.as_slice() {
        [] => None,
        [only] if only.role == InstructionRole::System => Some(SystemPrompt::Text(only.text.clone())),
        _ => Some(SystemPrompt::Blocks(system_parts)),
    };

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter(|t| t.tool_type == "function")
            .map(|t| Tool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                parameters: t.function.parameters.clone(),
            })
            .collect()
    });

    let tool_choice = match &req.tool_choice {
        None => None,
        Some(ChatToolChoice::String(mode)) => Some(
            ToolChoice::from_mode(Dialect::OpenAi, mode).ok_or_else(|| {
                GatewayError::invalid_request(format!("Unsupported tool_choice '{mode}'"))
            })?,
        ),
        Some(ChatToolChoice::Specific(specific)) => {
            Some(ToolChoice::Tool(specific.function.name.clone()))
        }
    };

    Ok(CanonicalRequest {
        model: req.model.clone(),
        system,
        messages,
        params: GenerationParams {
            max_tokens: req.max_tokens,
            max_completion_tokens: req.max_completion_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            stop: req.stop.clone().map(StopSpec::into_vec),
            user: req.user.clone(),
        },
        tools,
        tool_choice,
        stream: req.stream,
        extensions: Extensions::from_fields(Dialect::OpenAi, openai_extensions(req)),
    })
}

/// Unmodelled top-level fields plus `stream_options`, which only an
/// `OpenAI`-dialect target can honour.
fn openai_extensions(req: &ChatCompletionRequest) -> serde_json::Map<String, Value> {
    let mut fields = req.extra.clone();
    if let Some(options) = &req.stream_options {
        if let Ok(value) = serde_json::to_value(options) {
            fields.insert(STREAM_OPTIONS.to_string(), value);
        }
    }
    fields
}

fn user_blocks_from_openai(content: Option<&ChatContent>) -> Vec<ContentBlock> {
    match content {
        None => Vec::new(),
        Some(ChatContent::Text(t)) => vec![ContentBlock::Text(t.clone())],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => ContentBlock::Text(text.clone()),
                ContentPart::ImageUrl { image_url } => ContentBlock::Image {
                    source: ImageSource::from_url(&image_url.url),
                    detail: image_url.detail.clone(),
                },
            })
            .collect(),
    }
}

fn assistant_blocks_from_openai(msg: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(content) = &msg.content {
        let text = content.text();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text(text));
        }
    }

    for call in msg.tool_calls.iter().flatten() {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input: parse_arguments(&call.function.arguments),
        });
    }

    blocks
}

/// Tool arguments arrive as a JSON string; unparseable text is kept verbatim.
pub(crate) fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

pub(crate) fn render_arguments(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn canonical_to_openai(req: &CanonicalRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    match &req.system {
        Some(SystemPrompt::Text(t)) => {
            messages.push(ChatMessage::new("system", Some(ChatContent::Text(t.clone()))));
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            for entry in blocks {
                messages.push(ChatMessage::new(
                    entry.role.as_str(),
                    Some(ChatContent::Text(entry.text.clone())),
                ));
            }
        }
        None => {}
    }

    for msg in &req.messages {
        match msg.role {
            Role::User => {
                let mut converted = user_message_to_openai(&msg.content);
                for chat in converted.iter_mut().filter(|m| m.role == "user") {
                    chat.name = msg.name.clone();
                }
                messages.append(&mut converted);
            }
            Role::Assistant => {
                let mut chat = assistant_message_to_openai(&msg.content);
                chat.name = msg.name.clone();
                messages.push(chat);
            }
        }
    }

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    });

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoice::Tool(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
        mode => ChatToolChoice::String(
            mode.mode_name(Dialect::OpenAi).unwrap_or("auto").to_string(),
        ),
    });

    let mut extra = req.extensions_for(Dialect::OpenAi);
    // Translated streams need usage in the final chunk unless the client chose otherwise.
    let stream_options = extra
        .remove(STREAM_OPTIONS)
        .and_then(|v| serde_json::from_value::<StreamOptions>(v).ok())
        .or_else(|| {
            req.stream.filter(|s| *s).map(|_| StreamOptions {
                include_usage: true,
            })
        });

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.params.max_tokens,
        max_completion_tokens: req.params.max_completion_tokens,
        temperature: req.params.temperature,
        top_p: req.params.top_p,
        stream: req.stream,
        stream_options,
        tools,
        tool_choice,
        stop: req.params.stop.clone().map(StopSpec::Many),
        user: req.params.user.clone(),
        extra,
    }
}

fn user_message_to_openai(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text(text) => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source, detail } => {
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: source.to_url(),
                        detail: detail.clone(),
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Flush any accumulated content parts as a user message first
                if !content_parts.is_empty() {
                    messages.push(ChatMessage::new(
                        "user",
                        Some(collapse_content_parts(&content_parts)),
                    ));
                    content_parts.clear();
                }

                let mut tool_msg = ChatMessage::new(
                    "tool",
                    Some(ChatContent::Text(tool_result_to_string(
                        content.as_ref(),
                        *is_error,
                    ))),
                );
                tool_msg.tool_call_id = Some(tool_use_id.clone());
                messages.push(tool_msg);
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
        }
    }

    if !content_parts.is_empty() {
        messages.push(ChatMessage::new(
            "user",
            Some(collapse_content_parts(&content_parts)),
        ));
    }

    // If nothing was produced (empty message), emit an empty user message
    if messages.is_empty() {
        messages.push(ChatMessage::new("user", Some(ChatContent::Text(String::new()))));
    }

    messages
}

fn assistant_message_to_openai(blocks: &[ContentBlock]) -> ChatMessage {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text(text) => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: render_arguments(input),
                    },
                });
            }
            ContentBlock::Thinking { .. }
            | ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. } => {}
        }
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text_parts.concat()))
    };

    let mut msg = ChatMessage::new("assistant", content);
    if !tool_calls.is_empty() {
        msg.tool_calls = Some(tool_calls);
    }
    msg
}

fn collapse_content_parts(parts: &[ContentPart]) -> ChatContent {
    if let [ContentPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

fn tool_result_to_string(content: Option<&ToolOutput>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };

    match content {
        Some(output) => format!("{prefix}{}", output.text()),
        None => format!("{prefix}(no content)"),
    }
}
