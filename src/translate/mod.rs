//! API translation between the Anthropic Messages and `OpenAI` Chat Completions dialects.
//!
//! Both dialects convert to and from a shared canonical representation
//! ([`canonical`]), so each direction is one decoder plus one encoder. All
//! translation functions are pure (no I/O).

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod anthropic_types;
pub mod canonical;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;

pub use canonical::{CanonicalRequest, CanonicalResponse};
pub use request::{from_canonical, to_canonical, RequestHead, WireRequest};
pub use response::{from_canonical_response, to_canonical_response, WireResponse};
pub use streaming::StreamTranscoder;

/// A provider's request/response/streaming wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    /// Path appended to a provider base URL for chat requests.
    #[must_use]
    pub fn chat_path(self) -> &'static str {
        match self {
            Self::OpenAi => "/chat/completions",
            Self::Anthropic => "/v1/messages",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal sentinel appended to every gateway-produced event stream.
pub const STREAM_SENTINEL: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_names() {
        assert_eq!(Dialect::from_name("OpenAI"), Some(Dialect::OpenAi));
        assert_eq!(Dialect::from_name(" anthropic "), Some(Dialect::Anthropic));
        assert_eq!(Dialect::from_name("gemini"), None);
        assert_eq!(Dialect::OpenAi.to_string(), "openai");
    }

    #[test]
    fn test_dialect_serde_matches_config_spelling() {
        let d: Dialect = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(d, Dialect::OpenAi);
        assert_eq!(serde_json::to_string(&Dialect::Anthropic).unwrap(), "\"anthropic\"");
    }
}
