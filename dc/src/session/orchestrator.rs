//! Orchestrator - drives every queued inbound action
//!
//! Owns the primary engine and processes actions strictly one at a time. A
//! prompt in a non-default mode (or with a context reset) runs on a
//! sub-execution engine derived from the primary; once it finishes, the
//! primary is rebuilt from it so cost, commits and files carry over. Follow-up
//! reflections always run on the primary, up to a configured bound.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, info};

use super::SessionError;
use super::broker::{BrokerSettings, ConfirmationBroker};
use super::pipe::{PipeOutcome, StreamingPipe};
use super::state::{ExecutionHandle, SessionShared};
use super::sync::{ModelOverrides, PeerSync, PeerView};
use crate::config::SessionConfig;
use crate::engine::{
    ChatMessage, Engine, EngineError, EngineFactory, EngineIo, EngineSpec, FileEdit, History, Mode, ModelSelection,
    Role, parse_token_budget,
};
use crate::events::{EventSink, LISTEN_TO, OutboundEvent};
use crate::gateway::InboundAction;

const REASONING_EFFORTS: &[&str] = &["high", "medium", "low", "none"];

/// Run an engine call on a blocking thread
async fn blocking<T, F>(f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

pub struct Orchestrator {
    shared: Arc<SessionShared>,
    broker: Arc<ConfirmationBroker>,
    factory: Arc<dyn EngineFactory>,
    sink: EventSink,
    pipe: StreamingPipe,
    peer: Arc<PeerSync>,
    settings: SessionConfig,
    base_dir: PathBuf,
    primary: Arc<dyn Engine>,
    overrides: ModelOverrides,
}

impl Orchestrator {
    /// Build the session and its primary engine
    pub async fn new(
        factory: Arc<dyn EngineFactory>,
        spec: EngineSpec,
        sink: EventSink,
        settings: SessionConfig,
        base_dir: PathBuf,
    ) -> Result<Self, SessionError> {
        debug!(mode = %spec.mode, model = %spec.model.main, "Orchestrator::new: called");
        let shared = Arc::new(SessionShared::new());
        let broker = ConfirmationBroker::new(
            shared.clone(),
            sink.clone(),
            factory.clone(),
            Handle::current(),
            BrokerSettings::from(&settings),
        );
        let io: Arc<dyn EngineIo> = broker.clone();
        let overrides = ModelOverrides {
            reasoning_effort: spec.reasoning_effort.clone(),
            thinking_tokens: spec.thinking_tokens.clone(),
        };

        let engine_factory = factory.clone();
        let engine_io = io.clone();
        let (primary, known_models) = blocking(move || {
            let primary = engine_factory.create(spec, None, engine_io)?;
            Ok::<_, EngineError>((primary, engine_factory.known_models()))
        })
        .await??;

        let announcements = {
            let primary = primary.clone();
            blocking(move || primary.announcements()).await?
        };
        for line in announcements {
            info!("{}", line);
        }

        Ok(Self {
            peer: Arc::new(PeerSync::new(sink.clone(), io, known_models)),
            pipe: StreamingPipe::new(shared.clone(), sink.clone(), settings.chunk_yield()),
            shared,
            broker,
            factory,
            sink,
            settings,
            base_dir,
            primary,
            overrides,
        })
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn primary(&self) -> Arc<dyn Engine> {
        self.primary.clone()
    }

    fn io(&self) -> Arc<dyn EngineIo> {
        self.broker.clone()
    }

    /// Greet a newly attached peer
    pub async fn on_connect(&self) -> Result<(), SessionError> {
        info!(base_dir = %self.base_dir.display(), "Orchestrator::on_connect: peer attached");
        self.shared.set_connected(true);
        let sent = self.sink.emit(OutboundEvent::Init {
            base_dir: self.base_dir.display().to_string(),
            listen_to: LISTEN_TO.iter().map(|a| a.to_string()).collect(),
            input_history_file: None,
        });
        if !sent {
            return Err(SessionError::SinkClosed);
        }
        self.sync(&[PeerView::ContextFiles, PeerView::Autocompletion, PeerView::Models, PeerView::RepoMap])
            .await
    }

    /// Handle one action, reporting any failure to the peer
    pub async fn process(&mut self, action: InboundAction) {
        let kind = action.kind();
        if let Err(e) = self.handle(action).await {
            error!(action = kind, error = %e, "Orchestrator::process: action failed");
            self.broker.tool_error(&format!("Exception in connector: {}", e));
            self.sink.error_payload(e.to_string());
        }
    }

    pub async fn handle(&mut self, action: InboundAction) -> Result<(), SessionError> {
        debug!(action = action.kind(), "Orchestrator::handle: called");
        match action {
            InboundAction::AnswerQuestion { answer } => {
                self.reset_before_action();
                self.shared.register().set(answer);
                Ok(())
            }
            InboundAction::InterruptResponse => {
                self.shared.interrupt();
                Ok(())
            }
            other => {
                self.reset_before_action();
                self.handle_queued(other).await
            }
        }
    }

    fn reset_before_action(&self) {
        self.broker.reset_state();
        self.shared.clear_interrupted();
    }

    async fn handle_queued(&mut self, action: InboundAction) -> Result<(), SessionError> {
        match action {
            InboundAction::Prompt {
                prompt,
                mode,
                architect_model,
                prompt_id,
                clear_context,
            } => {
                let result = self
                    .run_prompt(prompt, mode, architect_model, clear_context.unwrap_or(false))
                    .await;
                if let Some(id) = prompt_id.filter(|id| !id.is_empty()) {
                    self.sink.prompt_finished(&id);
                }
                result
            }
            InboundAction::AddFile { path, read_only } => {
                let engine = self.primary.clone();
                let io = self.io();
                blocking(move || {
                    if let Err(e) = engine.add_file(&path, read_only.unwrap_or(false)) {
                        io.tool_error(&e.to_string());
                    }
                })
                .await?;
                self.sync(&[PeerView::ContextFiles, PeerView::Autocompletion, PeerView::TokensInfo])
                    .await
            }
            InboundAction::DropFile { path } => {
                let engine = self.primary.clone();
                let io = self.io();
                blocking(move || {
                    if let Err(e) = engine.drop_file(&path) {
                        io.tool_error(&e.to_string());
                    }
                })
                .await?;
                self.sync(&[PeerView::ContextFiles, PeerView::Autocompletion, PeerView::TokensInfo])
                    .await
            }
            InboundAction::SetModels { main_model, weak_model } => self.set_models(main_model, weak_model).await,
            InboundAction::RunCommand { command } => self.run_command(command).await,
            InboundAction::AddMessage {
                content,
                role,
                acknowledge,
            } => {
                let role = Role::parse(role.as_deref().unwrap_or("user"));
                let acknowledge = acknowledge.unwrap_or(true);
                let engine = self.primary.clone();
                blocking(move || {
                    engine.push_done_message(ChatMessage { role, content });
                    if role == Role::User && acknowledge {
                        engine.push_done_message(ChatMessage::assistant("Ok."));
                    }
                })
                .await?;
                self.sync(&[PeerView::TokensInfo]).await
            }
            InboundAction::ApplyEdits { edits } => self.apply_edits(edits).await,
            InboundAction::AnswerQuestion { .. } | InboundAction::InterruptResponse => Ok(()),
        }
    }

    async fn set_models(&mut self, main_model: String, weak_model: Option<String>) -> Result<(), SessionError> {
        info!(%main_model, ?weak_model, "Orchestrator::set_models: called");
        let factory = self.factory.clone();
        let primary = self.primary.clone();
        let io = self.io();
        self.primary = blocking(move || {
            for warning in factory.check_model(&main_model) {
                io.tool_warning(&warning);
            }
            let current = primary.model();
            let mut spec = EngineSpec::new(primary.mode(), ModelSelection::new(main_model).with_weak(weak_model));
            spec.reasoning_effort = current.reasoning_effort;
            spec.thinking_tokens = current.thinking_tokens;

            let engine = factory.create(spec, Some(&primary), io.clone())?;
            for line in engine.announcements() {
                io.tool_output(&line);
            }
            Ok::<_, EngineError>(engine)
        })
        .await??;
        self.sync(&[PeerView::Models, PeerView::TokensInfo]).await
    }

    async fn apply_edits(&mut self, edits: Vec<FileEdit>) -> Result<(), SessionError> {
        debug!(count = edits.len(), "Orchestrator::apply_edits: called");
        let count = edits.len();
        let engine = self.primary.clone();
        blocking(move || engine.apply_edits(&edits)).await??;
        self.sink.info(if count > 1 {
            "Files have been updated."
        } else {
            "File has been updated."
        });
        self.sync(&[PeerView::ContextFiles, PeerView::TokensInfo]).await
    }

    async fn run_command(&mut self, command: String) -> Result<(), SessionError> {
        let command = command.trim().to_string();
        debug!(%command, "Orchestrator::run_command: called");

        if command == "/map" {
            let engine = self.primary.clone();
            match blocking(move || engine.repo_map()).await?.filter(|m| !m.is_empty()) {
                Some(map) => self.sink.info(map),
                None => self.sink.info("No repo map available."),
            };
            return Ok(());
        }

        if command.starts_with("/reasoning-effort") {
            let args: Vec<&str> = command.split_whitespace().skip(1).collect();
            let Some(&value) = args.first().filter(|v| args.len() == 1 && REASONING_EFFORTS.contains(*v)) else {
                self.sink
                    .error("Invalid reasoning effort value. Use '/reasoning-effort [high|medium|low|none]'.");
                return Ok(());
            };
            if value == "none" {
                self.overrides.reasoning_effort = None;
                return self.sync(&[PeerView::Models]).await;
            }
            self.overrides.reasoning_effort = Some(value.to_string());
        }

        let synthetic = if let Some(rest) = command.strip_prefix("/run ").or_else(|| command.strip_prefix("/test ")) {
            Some(format!("Running {}", rest.trim()))
        } else if command.starts_with("/tokens") {
            Some("Running /tokens".to_string())
        } else {
            None
        };
        if let Some(line) = &synthetic {
            self.broker.start_command_tracking();
            self.broker.tool_output(line);
        }

        let engine = self.primary.clone();
        let io = self.io();
        let owned = command.clone();
        let ran = blocking(move || {
            if let Err(e) = engine.run_command(&owned) {
                io.tool_error(&e.to_string());
            }
        })
        .await;
        if synthetic.is_some() {
            self.broker.stop_command_tracking();
        }
        ran?;

        if command.starts_with("/paste") {
            self.sync(&[PeerView::ContextFiles]).await
        } else if command.starts_with("/clear") {
            self.sync(&[PeerView::TokensInfo]).await
        } else if command.starts_with("/map-refresh") {
            self.sink.info("The repo map has been refreshed.");
            self.sync(&[PeerView::Autocompletion, PeerView::RepoMap]).await
        } else if command.starts_with("/reasoning-effort") {
            self.sync(&[PeerView::Models]).await
        } else if command.starts_with("/think-tokens") {
            let engine = self.primary.clone();
            let cleared = blocking(move || {
                let budget = engine.model().thinking_tokens.as_deref().and_then(parse_token_budget);
                let zero = budget.is_none_or(|tokens| tokens == 0);
                if zero {
                    engine.set_thinking_tokens(None);
                }
                zero
            })
            .await?;
            if cleared {
                self.overrides.thinking_tokens = None;
            }
            self.sync(&[PeerView::Models]).await
        } else {
            Ok(())
        }
    }

    async fn run_prompt(
        &mut self,
        prompt: String,
        mode: Option<String>,
        architect_model: Option<String>,
        clear_context: bool,
    ) -> Result<(), SessionError> {
        info!(?mode, ?architect_model, clear_context, "Orchestrator::run_prompt: called");
        let result = self.prompt_lifecycle(prompt, mode, architect_model, clear_context).await;

        self.shared.set_active(None);
        let synced = self
            .sync(&[PeerView::Autocompletion, PeerView::TokensInfo, PeerView::RepoMap])
            .await;
        result.and(synced)
    }

    async fn prompt_lifecycle(
        &mut self,
        prompt: String,
        mode: Option<String>,
        architect_model: Option<String>,
        clear_context: bool,
    ) -> Result<(), SessionError> {
        let mode = mode.as_deref().map(Mode::from).filter(|m| !m.is_default());
        let sub_execution = mode.is_some() || clear_context;

        let running = if sub_execution {
            self.sub_execution_engine(mode, architect_model, clear_context).await?
        } else {
            self.primary.clone()
        };

        let execution = Arc::new(ExecutionHandle::new(running.clone()));
        self.shared.set_active(Some(execution.clone()));
        let outcome = self.pipe.run(&execution, &prompt, None).await?;
        note_interruption(&running, &outcome).await?;

        if sub_execution {
            self.fold_back(&running, clear_context).await?;
        }
        self.sync(&[PeerView::ContextFiles]).await?;

        self.reflect(running).await
    }

    /// Engine for a prompt that doesn't run on the primary
    async fn sub_execution_engine(
        &self,
        mode: Option<Mode>,
        architect_model: Option<String>,
        clear_context: bool,
    ) -> Result<Arc<dyn Engine>, SessionError> {
        let factory = self.factory.clone();
        let primary = self.primary.clone();
        let io = self.io();
        let engine = blocking(move || {
            let current = primary.model();
            let mode = mode.unwrap_or_else(|| primary.mode());
            let mut selection = current.selection();
            if mode == Mode::Architect
                && let Some(architect) = architect_model.filter(|m| !m.is_empty())
            {
                for warning in factory.check_model(&architect) {
                    io.tool_warning(&warning);
                }
                selection = ModelSelection::new(architect)
                    .with_weak(Some(current.weak_model.clone()))
                    .with_editor(Some(current.name.clone()));
            }
            debug!(%mode, model = %selection.main, "Orchestrator::sub_execution_engine: creating");

            let mut spec = EngineSpec::new(mode, selection).without_summarization();
            spec.reasoning_effort = current.reasoning_effort;
            spec.thinking_tokens = current.thinking_tokens;
            if clear_context {
                spec = spec.with_history(History::default());
            }
            factory.create(spec, Some(&primary), io)
        })
        .await??;
        Ok(engine)
    }

    /// Rebuild the primary from a finished sub-execution
    async fn fold_back(&mut self, running: &Arc<dyn Engine>, clear_context: bool) -> Result<(), SessionError> {
        debug!(clear_context, "Orchestrator::fold_back: called");
        let factory = self.factory.clone();
        let primary = self.primary.clone();
        let running = running.clone();
        let io = self.io();
        self.primary = blocking(move || {
            let history = if clear_context {
                primary.history()
            } else {
                running.history()
            };
            let current = primary.model();
            let mut spec = EngineSpec::new(primary.mode(), current.selection())
                .without_summarization()
                .with_history(history);
            spec.reasoning_effort = current.reasoning_effort;
            spec.thinking_tokens = current.thinking_tokens;
            factory.create(spec, Some(&running), io)
        })
        .await??;
        Ok(())
    }

    /// Re-run follow-up prompts the engine asks for, up to the configured bound
    async fn reflect(&mut self, running: Arc<dyn Engine>) -> Result<(), SessionError> {
        let max = self.settings.max_reflections;
        let mut count = 0;
        let mut reflected = blocking(move || running.reflected_message()).await?;

        while let Some(message) = reflected {
            if self.shared.is_interrupted() {
                debug!("Orchestrator::reflect: interrupted, not reflecting");
                break;
            }
            if count >= max {
                self.broker
                    .tool_warning(&format!("Only {} reflections allowed, stopping.", max));
                break;
            }
            count += 1;
            info!(iteration = count, max, "Orchestrator::reflect: reflecting");
            self.sink.loading("Reflecting message...");

            let engine = self.primary.clone();
            let execution = Arc::new(ExecutionHandle::new(engine.clone()));
            self.shared.set_active(Some(execution.clone()));
            let outcome = self.pipe.run(&execution, &message, Some(&message)).await?;
            note_interruption(&engine, &outcome).await?;
            self.sync(&[PeerView::ContextFiles]).await?;

            reflected = blocking(move || engine.reflected_message()).await?;
        }
        Ok(())
    }

    async fn sync(&self, views: &[PeerView]) -> Result<(), SessionError> {
        let peer = self.peer.clone();
        let engine = self.primary.clone();
        let overrides = self.overrides.clone();
        let views = views.to_vec();
        blocking(move || peer.send(engine.as_ref(), &views, &overrides)).await
    }
}

/// Record a cut-short reply in the engine's history
async fn note_interruption(engine: &Arc<dyn Engine>, outcome: &PipeOutcome) -> Result<(), SessionError> {
    if !outcome.interrupted {
        return Ok(());
    }
    let engine = engine.clone();
    let message = ChatMessage::assistant(format!("{} (interrupted)", outcome.content));
    blocking(move || engine.push_cur_message(message)).await
}
