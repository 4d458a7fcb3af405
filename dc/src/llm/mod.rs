//! Streaming chat clients for the built-in engine

use std::sync::Arc;

use tracing::debug;

mod anthropic;
pub mod client;
mod error;
mod openai;
mod types;

pub use anthropic::AnthropicClient;
pub use client::{LlmClient, ReplyStream, collect_reply};
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use types::{ChatReply, ChatRequest, Finish, ReplyEvent, Speaker, Turn, Usage};

/// Connection details for one model
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// `anthropic` or `openai`
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    /// Upper bound applied to every request
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

pub fn create_client(settings: &ClientSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(provider = %settings.provider, model = %settings.model, "create_client: called");
    let client: Arc<dyn LlmClient> = match settings.provider.to_ascii_lowercase().as_str() {
        "anthropic" => Arc::new(AnthropicClient::from_settings(settings)?),
        "openai" => Arc::new(OpenAIClient::from_settings(settings)?),
        _ => return Err(LlmError::UnknownProvider(settings.provider.clone())),
    };
    Ok(client)
}
