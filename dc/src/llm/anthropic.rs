//! Anthropic Messages API over server-sent events

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use tracing::debug;

use super::client::{ReplySender, ReplyStream, reply_channel};
use super::{ChatReply, ChatRequest, ClientSettings, Finish, LlmClient, LlmError, ReplyEvent, Usage};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    http: Client,
}

impl AnthropicClient {
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, LlmError> {
        debug!(model = %settings.model, base_url = %settings.base_url, "AnthropicClient::from_settings: called");
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

    fn body(&self, request: &ChatRequest) -> Value {
        let turns: Vec<Value> = request
            .turns
            .iter()
            .map(|turn| json!({ "role": turn.speaker, "content": turn.text }))
            .collect();
        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system,
            "messages": turns,
            "stream": true,
        });
        if let Some(budget) = request.thinking_budget.filter(|b| *b > 0) {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        body
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn reply_stream(&self, request: ChatRequest) -> Result<ReplyStream, LlmError> {
        debug!(model = %self.model, turns = request.turns.len(), "AnthropicClient::reply_stream: called");
        let builder = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.body(&request));
        let source = EventSource::new(builder).map_err(|e| LlmError::Malformed(e.to_string()))?;

        let (tx, stream) = reply_channel();
        tokio::spawn(pump(source, tx));
        Ok(stream)
    }
}

/// What one SSE payload means for the reply
#[derive(Debug, PartialEq)]
enum Step {
    Nothing,
    Text(String),
    Done,
}

/// Accumulates a streamed message from its SSE payloads
#[derive(Debug, Default)]
struct MessageFold {
    text: String,
    usage: Usage,
    finish: Finish,
}

impl MessageFold {
    fn apply(&mut self, data: &Value) -> Result<Step, LlmError> {
        let count = |v: &Value, key: &str| v[key].as_u64().unwrap_or(0);
        match data["type"].as_str() {
            Some("message_start") => {
                let usage = &data["message"]["usage"];
                self.usage.prompt = count(usage, "input_tokens");
                self.usage.cache_read = count(usage, "cache_read_input_tokens");
                self.usage.cache_write = count(usage, "cache_creation_input_tokens");
                Ok(Step::Nothing)
            }
            Some("content_block_delta") => match data["delta"]["text"].as_str() {
                Some(text) if !text.is_empty() => {
                    self.text.push_str(text);
                    Ok(Step::Text(text.to_string()))
                }
                _ => Ok(Step::Nothing),
            },
            Some("message_delta") => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.finish = Finish::from_reason(reason);
                }
                if data.get("usage").is_some() {
                    self.usage.completion = count(&data["usage"], "output_tokens");
                }
                Ok(Step::Nothing)
            }
            Some("message_stop") => Ok(Step::Done),
            Some("error") => Err(LlmError::Stream(
                data["error"]["message"].as_str().unwrap_or("unknown error").to_string(),
            )),
            _ => Ok(Step::Nothing),
        }
    }

    fn into_reply(self) -> ChatReply {
        ChatReply {
            text: self.text,
            finish: self.finish,
            usage: self.usage,
        }
    }
}

async fn pump(mut source: EventSource, tx: ReplySender) {
    let mut fold = MessageFold::default();
    while let Some(event) = source.next().await {
        let step = match event {
            Ok(Event::Open) => continue,
            Ok(Event::Message(message)) => serde_json::from_str::<Value>(&message.data)
                .map_err(LlmError::from)
                .and_then(|data| fold.apply(&data)),
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => Err(LlmError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
            Err(e) => Err(LlmError::Stream(e.to_string())),
        };

        match step {
            Ok(Step::Nothing) => {}
            Ok(Step::Text(text)) => {
                if tx.unbounded_send(Ok(ReplyEvent::Text(text))).is_err() {
                    debug!("anthropic::pump: reader gone, closing stream");
                    break;
                }
            }
            Ok(Step::Done) => {
                source.close();
                let _ = tx.unbounded_send(Ok(ReplyEvent::Finished(fold.into_reply())));
                return;
            }
            Err(e) => {
                debug!(error = %e, "anthropic::pump: stream failed");
                source.close();
                let _ = tx.unbounded_send(Err(e));
                return;
            }
        }
    }
    source.close();
    let _ = tx.unbounded_send(Err(LlmError::Stream("connection closed before message_stop".to_string())));
}
