//! StreamingPipe - drains one run's chunk source into `response` events
//!
//! Pulls exactly one chunk per blocking hop, forwards it as a progress event,
//! then sleeps for the chunk-yield interval so an interrupt can land before
//! the next pull. Ends with a single terminal event.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::SessionError;
use super::state::{ExecutionHandle, SessionShared};
use crate::engine::CommitInfo;
use crate::events::{EventSink, ResponsePayload};

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeOutcome {
    /// Full text of the run, as carried by its terminal event
    pub content: String,
    pub interrupted: bool,
    /// An editor pass took over and the terminal event was left to it
    pub handed_off: bool,
    /// At least one chunk was produced
    pub streamed: bool,
}

struct TerminalDetails {
    partial: Option<String>,
    edited_files: Vec<String>,
    usage_report: Option<String>,
    commit: Option<CommitInfo>,
    diff: Option<String>,
}

/// Streams engine output to the peer
#[derive(Clone)]
pub struct StreamingPipe {
    shared: Arc<SessionShared>,
    sink: EventSink,
    chunk_yield: Duration,
}

impl StreamingPipe {
    pub fn new(shared: Arc<SessionShared>, sink: EventSink, chunk_yield: Duration) -> Self {
        Self {
            shared,
            sink,
            chunk_yield,
        }
    }

    /// Run `prompt` through the execution's engine
    ///
    /// `reflected_message` tags every event of a reflection iteration.
    pub async fn run(
        &self,
        execution: &Arc<ExecutionHandle>,
        prompt: &str,
        reflected_message: Option<&str>,
    ) -> Result<PipeOutcome, SessionError> {
        debug!(prompt_len = prompt.len(), reflection = reflected_message.is_some(), "StreamingPipe::run: called");
        let engine = execution.engine().clone();
        let owned_prompt = prompt.to_string();
        let mut source = tokio::task::spawn_blocking(move || engine.run_stream(&owned_prompt)).await?;

        let mut streamed = false;
        let mut interrupted = false;
        // Chunks that arrived after an editor pass took over
        let mut tail = false;

        loop {
            if self.shared.is_interrupted() {
                debug!("StreamingPipe::run: interrupted, stopping pulls");
                interrupted = true;
                break;
            }

            let (returned, next) = tokio::task::spawn_blocking(move || {
                let next = source.next_chunk();
                (source, next)
            })
            .await?;
            source = returned;

            match next {
                None => {
                    debug!("StreamingPipe::run: source exhausted");
                    break;
                }
                Some(Ok(chunk)) => {
                    streamed = true;
                    tail |= execution.is_handed_off();
                    execution.append(&chunk);
                    self.sink.progress(&chunk, reflected_message);
                    tokio::time::sleep(self.chunk_yield).await;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "StreamingPipe::run: chunk pull failed");
                    self.sink.error(e.to_string());
                    break;
                }
            }
        }

        let engine = execution.engine().clone();
        let details = tokio::task::spawn_blocking(move || {
            let partial = (!streamed).then(|| engine.partial_response());
            let commit = engine.last_commit();
            let diff = commit.as_ref().and_then(|c| {
                match engine.diff_commits(&format!("{}~1", c.hash), &c.hash) {
                    Ok(diff) => Some(diff),
                    Err(e) => {
                        warn!(hash = %c.hash, error = %e, "StreamingPipe::run: diff failed");
                        None
                    }
                }
            });
            TerminalDetails {
                partial,
                edited_files: engine.edited_files(),
                usage_report: engine.usage_report(),
                commit,
                diff,
            }
        })
        .await?;

        if let Some(partial) = details.partial.filter(|p| !p.is_empty()) {
            debug!("StreamingPipe::run: nothing streamed, using partial response");
            execution.set_content(partial);
        }

        let handed_off = execution.is_handed_off() && !tail;
        let content = execution.content();

        if handed_off {
            debug!("StreamingPipe::run: output handed to editor pass, no terminal event");
        } else {
            let (commit_hash, commit_message) = match details.commit {
                Some(commit) => (Some(commit.hash), Some(commit.message)),
                None => (None, None),
            };
            self.sink.response(ResponsePayload {
                content: content.clone(),
                finished: true,
                reflected_message: reflected_message.map(String::from),
                edited_files: Some(details.edited_files),
                usage_report: details.usage_report,
                commit_hash,
                commit_message,
                diff: details.diff,
                interrupted: interrupted.then_some(true),
            });
        }

        Ok(PipeOutcome {
            content,
            interrupted,
            handed_off,
            streamed,
        })
    }
}
