//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown provider '{provider}'")]
    UnknownProvider { provider: String },

    #[error("Unknown model: {message}")]
    UnknownModel { message: String },

    #[error("Provider '{provider}' requires passthrough authentication, but no client API key was provided")]
    Auth { provider: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Upstream timed out: {message}")]
    UpstreamTimeout { message: String },

    #[error("Upstream returned status {status}: {message}")]
    UpstreamHttp { status: u16, message: String },

    #[error("Conversion error: {message}")]
    Conversion { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Seconds a client should wait before retrying after an upstream timeout.
pub const RETRY_AFTER_SECS: u64 = 5;

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unknown_provider(provider: impl Into<String>) -> Self {
        Self::UnknownProvider {
            provider: provider.into(),
        }
    }

    pub fn unknown_model(msg: impl Into<String>) -> Self {
        Self::UnknownModel {
            message: msg.into(),
        }
    }

    pub fn auth(provider: impl Into<String>) -> Self {
        Self::Auth {
            provider: provider.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn upstream_timeout(msg: impl Into<String>) -> Self {
        Self::UpstreamTimeout {
            message: msg.into(),
        }
    }

    pub fn upstream_http(status: u16, msg: impl Into<String>) -> Self {
        Self::UpstreamHttp {
            status,
            message: msg.into(),
        }
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion {
            message: msg.into(),
        }
    }

    /// Classify a transport error, separating timeouts from everything else.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::upstream_timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::upstream_http(status.as_u16(), err.to_string())
        } else {
            Self::Http(err)
        }
    }

    /// HTTP status surfaced to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config { .. } => 500,
            Self::UnknownProvider { .. } | Self::UnknownModel { .. } => 404,
            Self::Auth { .. } => 401,
            Self::InvalidRequest { .. } | Self::Json(_) => 400,
            Self::UpstreamTimeout { .. } => 504,
            Self::UpstreamHttp { status, .. } => *status,
            Self::Conversion { .. } | Self::Http(_) => 502,
            Self::Io(_) | Self::Toml(_) => 500,
        }
    }

    /// Value of `error.type` in the client-facing envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config { .. } | Self::Io(_) | Self::Toml(_) => "api_error",
            Self::UnknownProvider { .. } | Self::UnknownModel { .. } => "not_found_error",
            Self::Auth { .. } => "authentication_error",
            Self::InvalidRequest { .. } | Self::Json(_) => "invalid_request_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamHttp { status, .. } => match status {
                400 => "invalid_request_error",
                401 => "authentication_error",
                403 => "permission_error",
                404 => "not_found_error",
                429 => "rate_limit_error",
                529 => "overloaded_error",
                _ => "api_error",
            },
            Self::Conversion { .. } | Self::Http(_) => "api_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UpstreamTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
