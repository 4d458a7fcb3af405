//! OpenAI Chat Completions API, streamed
//!
//! The response body is read as raw SSE lines; there is no event-source
//! layer in between.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::client::{ReplySender, ReplyStream, reply_channel, send_with_retry};
use super::{ChatReply, ChatRequest, ClientSettings, Finish, LlmClient, LlmError, ReplyEvent, Usage};

const DONE_MARKER: &str = "[DONE]";

pub struct OpenAIClient {
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    http: Client,
}

impl OpenAIClient {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, LlmError> {
        debug!(model = %settings.model, base_url = %settings.base_url, "OpenAIClient::from_settings: called");
        let http = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_tokens: settings.max_tokens,
            http,
        })
    }

    /// o-series and gpt-5 want `max_completion_tokens` and accept `reasoning_effort`
    fn reasoning(&self) -> bool {
        ["o1", "o3", "o4", "gpt-5"].iter().any(|prefix| self.model.starts_with(prefix))
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(json!({ "role": "system", "content": request.system }));
        messages.extend(
            request
                .turns
                .iter()
                .map(|turn| json!({ "role": turn.speaker, "content": turn.text })),
        );

        let limit = request.max_tokens.min(self.max_tokens);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if self.reasoning() {
            body["max_completion_tokens"] = json!(limit);
            if let Some(effort) = &request.reasoning_effort {
                body["reasoning_effort"] = json!(effort);
            }
        } else {
            body["max_tokens"] = json!(limit);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn reply_stream(&self, request: ChatRequest) -> Result<ReplyStream, LlmError> {
        debug!(model = %self.model, turns = request.turns.len(), "OpenAIClient::reply_stream: called");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.body(&request);
        let response = send_with_retry(|| self.http.post(&url).bearer_auth(&self.api_key).json(&body)).await?;

        let (tx, stream) = reply_channel();
        tokio::spawn(pump(response.bytes_stream(), tx));
        Ok(stream)
    }
}

/// Reassembles `data:` payloads from arbitrarily split body bytes
#[derive(Debug, Default)]
struct SseLines {
    pending: String,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            if let Some(data) = line.trim().strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

/// Accumulates a streamed completion from its chunk payloads
#[derive(Debug, Default)]
struct CompletionFold {
    text: String,
    usage: Usage,
    finish: Finish,
    done: bool,
}

impl CompletionFold {
    /// Returns the text delta carried by `payload`, if any
    fn apply(&mut self, payload: &str) -> Option<String> {
        if payload == DONE_MARKER {
            self.done = true;
            return None;
        }
        let chunk: Chunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "CompletionFold::apply: skipping unparseable chunk");
                return None;
            }
        };
        if let Some(usage) = chunk.usage {
            // OpenAI counts cached tokens inside prompt_tokens
            let cached = usage.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0);
            self.usage.prompt = usage.prompt_tokens.saturating_sub(cached);
            self.usage.cache_read = cached;
            self.usage.completion = usage.completion_tokens;
        }
        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish = Finish::from_reason(reason);
        }
        let text = choice.delta.content.filter(|t| !t.is_empty())?;
        self.text.push_str(&text);
        Some(text)
    }

    fn into_reply(self) -> ChatReply {
        ChatReply {
            text: self.text,
            finish: self.finish,
            usage: self.usage,
        }
    }
}

async fn pump<S, B>(body: S, tx: ReplySender)
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut lines = SseLines::default();
    let mut fold = CompletionFold::default();

    while let Some(bytes) = body.next().await {
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "openai::pump: body read failed");
                let _ = tx.unbounded_send(Err(LlmError::Stream(e.to_string())));
                return;
            }
        };
        for payload in lines.push(bytes.as_ref()) {
            if let Some(text) = fold.apply(&payload)
                && tx.unbounded_send(Ok(ReplyEvent::Text(text))).is_err()
            {
                debug!("openai::pump: reader gone, dropping body");
                return;
            }
        }
        if fold.done {
            break;
        }
    }
    if !fold.done {
        debug!("openai::pump: body ended without done marker");
    }
    let _ = tx.unbounded_send(Ok(ReplyEvent::Finished(fold.into_reply())));
}
