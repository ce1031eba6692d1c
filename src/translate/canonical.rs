//! Dialect-neutral request/response representation.
//!
//! Every field either dialect defines has a home here. Fields only one dialect
//! understands travel in [`Extensions`] and are re-emitted solely into the
//! dialect they came from. Enumeration remaps between the dialects live in the
//! static tables at the bottom of this module.

use super::Dialect;
use serde_json::{Map, Value};

/// `max_tokens` sent to Anthropic-dialect providers when the client set none.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<SystemPrompt>,
    pub messages: Vec<Message>,
    pub params: GenerationParams,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: Option<bool>,
    pub extensions: Option<Extensions>,
}

impl CanonicalRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Dialect-specific extra fields, if they belong to `dialect`.
    pub fn extensions_for(&self, dialect: Dialect) -> Map<String, Value> {
        match &self.extensions {
            Some(ext) if ext.dialect == dialect => ext.fields.clone(),
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemEntry>),
}

impl SystemPrompt {
    pub fn joined(&self, sep: &str) -> String {
        match self {
            SystemPrompt::Text(t) => t.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join(sep),
        }
    }
}

/// One instruction entry. `OpenAI` distinguishes `system` from `developer`;
/// Anthropic has only the former.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemEntry {
    pub text: String,
    pub role: InstructionRole,
}

impl SystemEntry {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            role: InstructionRole::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionRole {
    System,
    Developer,
}

impl InstructionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            InstructionRole::System => "system",
            InstructionRole::Developer => "developer",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: Option<u64>,
    /// `OpenAI` reasoning models accept only this spelling of the output limit.
    pub max_completion_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub stop: Option<Vec<String>>,
    pub user: Option<String>,
}

impl GenerationParams {
    /// Output token limit under either spelling.
    pub fn output_limit(&self) -> Option<u64> {
        self.max_tokens.or(self.max_completion_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// `OpenAI` participant name.
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image {
        source: ImageSource,
        detail: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Option<ToolOutput>,
        is_error: Option<bool>,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolOutput {
    pub fn text(&self) -> String {
        match self {
            ToolOutput::Text(t) => t.clone(),
            ToolOutput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url(String),
}

impl ImageSource {
    /// Parse an `OpenAI` `image_url`, recognising `data:<mime>;base64,<data>` URIs.
    pub fn from_url(url: &str) -> Self {
        if let Some(rest) = url.strip_prefix("data:") {
            if let Some((media_type, data)) = rest.split_once(";base64,") {
                return ImageSource::Base64 {
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                };
            }
        }
        ImageSource::Url(url.to_string())
    }

    pub fn to_url(&self) -> String {
        match self {
            ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extensions {
    pub dialect: Dialect,
    pub fields: Map<String, Value>,
}

impl Extensions {
    pub fn from_fields(dialect: Dialect, fields: Map<String, Value>) -> Option<Self> {
        if fields.is_empty() {
            None
        } else {
            Some(Self { dialect, fields })
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
    Other(String),
}

// ---------------------------------------------------------------------------
// Static lookup tables
// ---------------------------------------------------------------------------

/// (canonical, anthropic `stop_reason`, openai `finish_reason`). The first row
/// matching a name wins, so aliases come after the primary spelling.
const STOP_REASONS: &[(StopReason, &str, &str)] = &[
    (StopReason::EndTurn, "end_turn", "stop"),
    (StopReason::MaxTokens, "max_tokens", "length"),
    (StopReason::StopSequence, "stop_sequence", "stop"),
    (StopReason::ToolUse, "tool_use", "tool_calls"),
    (StopReason::ToolUse, "tool_use", "function_call"),
    (StopReason::Refusal, "refusal", "content_filter"),
];

/// (canonical, anthropic `tool_choice.type`, openai `tool_choice` string)
const TOOL_CHOICES: &[(ToolChoice, &str, &str)] = &[
    (ToolChoice::Auto, "auto", "auto"),
    (ToolChoice::Any, "any", "required"),
    (ToolChoice::None, "none", "none"),
];

const ROLES: &[(Role, &str)] = &[(Role::User, "user"), (Role::Assistant, "assistant")];

impl StopReason {
    pub fn from_wire(dialect: Dialect, name: &str) -> Self {
        STOP_REASONS
            .iter()
            .find(|(_, anthropic, openai)| match dialect {
                Dialect::Anthropic => *anthropic == name,
                Dialect::OpenAi => *openai == name,
            })
            .map(|(reason, _, _)| reason.clone())
            .unwrap_or_else(|| StopReason::Other(name.to_string()))
    }

    pub fn to_wire(&self, dialect: Dialect) -> String {
        if let StopReason::Other(name) = self {
            return name.clone();
        }
        STOP_REASONS
            .iter()
            .find(|(reason, _, _)| reason == self)
            .map(|(_, anthropic, openai)| match dialect {
                Dialect::Anthropic => (*anthropic).to_string(),
                Dialect::OpenAi => (*openai).to_string(),
            })
            .unwrap_or_default()
    }
}

impl ToolChoice {
    /// Only the mode variants; a named tool choice is structured on both sides.
    pub fn from_mode(dialect: Dialect, name: &str) -> Option<Self> {
        TOOL_CHOICES
            .iter()
            .find(|(_, anthropic, openai)| match dialect {
                Dialect::Anthropic => *anthropic == name,
                Dialect::OpenAi => *openai == name,
            })
            .map(|(choice, _, _)| choice.clone())
    }

    pub fn mode_name(&self, dialect: Dialect) -> Option<&'static str> {
        TOOL_CHOICES
            .iter()
            .find(|(choice, _, _)| choice == self)
            .map(|(_, anthropic, openai)| match dialect {
                Dialect::Anthropic => *anthropic,
                Dialect::OpenAi => *openai,
            })
    }
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        ROLES.iter().find(|(_, n)| *n == name).map(|(r, _)| *r)
    }

    pub fn as_str(self) -> &'static str {
        ROLES
            .iter()
            .find(|(r, _)| *r == self)
            .map(|(_, n)| *n)
            .unwrap_or("user")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_tables() {
        assert_eq!(
            StopReason::from_wire(Dialect::OpenAi, "length"),
            StopReason::MaxTokens
        );
        assert_eq!(
            StopReason::from_wire(Dialect::OpenAi, "function_call"),
            StopReason::ToolUse
        );
        assert_eq!(StopReason::ToolUse.to_wire(Dialect::OpenAi), "tool_calls");
        assert_eq!(StopReason::StopSequence.to_wire(Dialect::OpenAi), "stop");
        assert_eq!(
            StopReason::from_wire(Dialect::Anthropic, "pause_turn"),
            StopReason::Other("pause_turn".to_string())
        );
        assert_eq!(
            StopReason::Other("pause_turn".to_string()).to_wire(Dialect::OpenAi),
            "pause_turn"
        );
    }

    #[test]
    fn test_tool_choice_table() {
        assert_eq!(
            ToolChoice::from_mode(Dialect::OpenAi, "required"),
            Some(ToolChoice::Any)
        );
        assert_eq!(ToolChoice::Any.mode_name(Dialect::Anthropic), Some("any"));
        assert_eq!(ToolChoice::Tool("x".into()).mode_name(Dialect::OpenAi), None);
    }

    #[test]
    fn test_data_uri_images() {
        let img = ImageSource::from_url("data:image/png;base64,AAAA");
        assert_eq!(
            img,
            ImageSource::Base64 {
                media_type: "image/png".to_string(),
                data: "AAAA".to_string()
            }
        );
        assert_eq!(img.to_url(), "data:image/png;base64,AAAA");
        assert_eq!(
            ImageSource::from_url("https://x/y.png"),
            ImageSource::Url("https://x/y.png".to_string())
        );
    }
}
