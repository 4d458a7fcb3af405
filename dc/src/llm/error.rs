//! LLM client errors

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Provider rate limit hit, retry after {0:?}")]
    RateLimited(Duration),

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Reply stream broke off: {0}")]
    Stream(String),

    #[error("Malformed provider reply: {0}")]
    Malformed(String),

    #[error("API key missing: set {0}")]
    MissingApiKey(String),

    #[error("Unknown LLM provider '{0}' (expected anthropic or openai)")]
    UnknownProvider(String),

    #[error("Bad JSON from provider: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Worth sending the same request again
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited(_) | LlmError::Transport(_) | LlmError::Stream(_) => true,
            LlmError::Http { status, .. } => is_transient_status(*status),
            LlmError::Malformed(_) | LlmError::MissingApiKey(_) | LlmError::UnknownProvider(_) | LlmError::Json(_) => {
                false
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited(after) => Some(*after),
            _ => None,
        }
    }
}

/// Statuses that tend to clear up on their own (529 is Anthropic's "overloaded")
pub(crate) fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 500 | 502 | 503 | 504 | 529)
}
