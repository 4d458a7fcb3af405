//! Connection loop
//!
//! Three tasks per connection:
//!
//! ```text
//! reader ──answer/interrupt──▶ SessionShared (immediately)
//!    │
//!    └──other actions──▶ queue ──▶ orchestrator ──▶ EventSink
//!                                                     │
//!                                      writer ◀───────┘ (one ordered channel)
//! ```
//!
//! The reader never waits on the orchestrator, so answers and interrupts land
//! while a prompt is streaming or blocked on a confirmation.

use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{InboundAction, parse_inbound};
use crate::events::{EventSink, OutboundEvent, TranscriptLogger};
use crate::session::Orchestrator;

/// How long to let the writer drain after the peer goes away
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct ServeOptions {
    /// Pause after every event that isn't a streamed chunk
    pub action_delay: Duration,
    pub transcript: Option<TranscriptLogger>,
}

/// Serve one peer connection until it closes
///
/// `events` is the receiving end of the sink the orchestrator was built with;
/// `sink` is a handle on the same channel for protocol errors.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    orchestrator: Orchestrator,
    sink: EventSink,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
    options: ServeOptions,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    debug!("serve: called");
    let shared = orchestrator.shared();
    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<InboundAction>();

    let writer_task = tokio::spawn(write_events(writer, events, options));
    let orchestrator_task = tokio::spawn(run_orchestrator(orchestrator, queue_rx));

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "serve: read failed, disconnecting");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_inbound(&line) {
            Ok(Some(InboundAction::AnswerQuestion { answer })) => {
                debug!(%answer, "serve: answer received");
                if let Some(command) = shared.reset_for_action() {
                    sink.use_command_output(&command, true);
                }
                shared.register().set(answer);
            }
            Ok(Some(InboundAction::InterruptResponse)) => {
                info!("Interrupting response");
                shared.interrupt();
            }
            Ok(Some(action)) => {
                if queue_tx.send(action).is_err() {
                    warn!("serve: orchestrator gone, disconnecting");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "serve: rejected inbound message");
                sink.error_payload(e.to_string());
            }
        }
    }

    shared.disconnect();
    drop(queue_tx);
    drop(sink);

    if let Err(e) = orchestrator_task.await {
        warn!(error = %e, "serve: orchestrator task failed");
    }

    let abort = writer_task.abort_handle();
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(e).context("Writer task failed"),
        Err(_) => {
            warn!("serve: writer did not drain in time");
            abort.abort();
            Ok(())
        }
    }
}

async fn run_orchestrator(mut orchestrator: Orchestrator, mut queue: mpsc::UnboundedReceiver<InboundAction>) {
    let shared = orchestrator.shared();
    if let Err(e) = orchestrator.on_connect().await {
        warn!(error = %e, "run_orchestrator: connect sync failed");
    }

    while let Some(action) = queue.recv().await {
        if !shared.is_connected() {
            debug!(action = action.kind(), "run_orchestrator: peer gone, dropping action");
            break;
        }
        orchestrator.process(action).await;
    }
    debug!("run_orchestrator: queue closed");
}

async fn write_events<W>(
    mut writer: W,
    mut events: mpsc::UnboundedReceiver<OutboundEvent>,
    mut options: ServeOptions,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_string(&event).context("Failed to serialize event")?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await.context("Failed to write event")?;
        writer.flush().await.context("Failed to flush event")?;

        if let Some(transcript) = options.transcript.as_mut()
            && let Err(e) = transcript.write_event(&event)
        {
            warn!(error = %e, "write_events: transcript write failed");
        }

        if !event.is_progress() && !options.action_delay.is_zero() {
            tokio::time::sleep(options.action_delay).await;
        }
    }
    debug!("write_events: all senders gone");
    Ok(())
}
