//! LlmClient trait and the HTTP plumbing shared by the providers

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use reqwest::header::RETRY_AFTER;
use tracing::{debug, warn};

use super::error::is_transient_status;
use super::{ChatReply, ChatRequest, LlmError, ReplyEvent};

/// Attempts per request, including the first
const ATTEMPTS: u32 = 4;

const FIRST_BACKOFF: Duration = Duration::from_millis(1000);

/// Seconds to wait on a 429 that carries no usable `retry-after`
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// A streamed reply; see [`ReplyEvent`] for the item contract
pub type ReplyStream = BoxStream<'static, Result<ReplyEvent, LlmError>>;

/// A chat model behind some provider API
///
/// Stateless: each request carries the whole conversation.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    /// Start a reply; text arrives as the returned stream is polled
    async fn reply_stream(&self, request: ChatRequest) -> Result<ReplyStream, LlmError>;

    /// Wait for the whole reply
    async fn reply(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        debug!(model = %self.model(), "LlmClient::reply: called");
        collect_reply(self.reply_stream(request).await?).await
    }
}

/// Drain a stream down to its final reply
pub async fn collect_reply(mut stream: ReplyStream) -> Result<ChatReply, LlmError> {
    while let Some(event) = stream.next().await {
        if let ReplyEvent::Finished(reply) = event? {
            return Ok(reply);
        }
    }
    Err(LlmError::Stream("ended before the reply finished".to_string()))
}

pub(crate) type ReplySender = mpsc::UnboundedSender<Result<ReplyEvent, LlmError>>;

/// Channel a provider task feeds while the caller polls the stream end
pub(crate) fn reply_channel() -> (ReplySender, ReplyStream) {
    let (tx, rx) = mpsc::unbounded();
    (tx, rx.boxed())
}

/// Send a request, retrying transient failures with exponential backoff
///
/// Rate limits are returned at once so the caller sees `retry-after`.
pub(crate) async fn send_with_retry<F>(build: F) -> Result<reqwest::Response, LlmError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let mut attempt = 0;
    loop {
        let result = match build().send().await {
            Ok(response) => check_status(response).await,
            Err(e) => Err(LlmError::Transport(e)),
        };
        match result {
            Ok(response) => return Ok(response),
            Err(e) if e.retry_after().is_none() && e.is_retryable() && attempt + 1 < ATTEMPTS => {
                let delay = FIRST_BACKOFF * 2u32.pow(attempt);
                warn!(attempt, ?delay, error = %e, "send_with_retry: transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn a non-success response into the matching error
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        let after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        debug!(after, "check_status: rate limited");
        return Err(LlmError::RateLimited(Duration::from_secs(after)));
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), transient = is_transient_status(status.as_u16()), "check_status: failed");
    Err(LlmError::Http {
        status: status.as_u16(),
        body,
    })
}
