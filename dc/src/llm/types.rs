//! Chat request and reply types shared by the provider clients

use serde::{Deserialize, Serialize};

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One turn of the conversation sent to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }
}

/// A single chat request
///
/// `turns` alternate speakers and end with the user.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub max_tokens: u32,
    /// `low`, `medium` or `high`; only reasoning models honour it
    pub reasoning_effort: Option<String>,
    /// Extended-thinking budget; zero disables thinking
    pub thinking_budget: Option<u32>,
}

/// How generation ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Finish {
    #[default]
    Complete,
    /// Hit the token limit
    Truncated,
    /// Hit a stop sequence
    Stopped,
}

impl Finish {
    /// Map a provider's stop/finish reason
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "max_tokens" | "length" => Finish::Truncated,
            "stop_sequence" => Finish::Stopped,
            _ => Finish::Complete,
        }
    }
}

/// Token counts reported for one reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt: u64,
    pub completion: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl Usage {
    /// Everything sent to the model, cached or not
    pub fn prompt_total(&self) -> u64 {
        self.prompt + self.cache_read + self.cache_write
    }

    /// Price in USD; cache reads bill at a tenth of the input rate
    pub fn price(&self, input_per_token: f64, output_per_token: f64) -> f64 {
        self.prompt as f64 * input_per_token
            + self.cache_read as f64 * input_per_token * 0.1
            + self.completion as f64 * output_per_token
    }
}

/// A finished reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub finish: Finish,
    pub usage: Usage,
}

/// Item of a streamed reply
///
/// A stream yields any number of `Text` items and ends with exactly one
/// `Finished`, unless it fails first.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Text(String),
    Finished(ChatReply),
}
