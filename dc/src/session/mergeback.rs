//! Editor pass for an approved plan
//!
//! When the planner asks to edit files and the peer agrees, the plan streamed
//! so far is closed with a planning-finished event and a fresh editor engine
//! runs the plan as its prompt. Its results are folded back into the planner.

use std::sync::Arc;

use tracing::{debug, info};

use super::SessionError;
use super::pipe::{PipeOutcome, StreamingPipe};
use super::state::ExecutionHandle;
use crate::engine::{EDITS_APPLIED_ACK, EngineFactory, EngineIo, EngineSpec, History, Mode, ModelInfo, ModelSelection};
use crate::events::{EventSink, ResponsePayload};

/// Spec for the editor engine that carries out a planner's plan
pub fn editor_spec(planner: &ModelInfo, total_cost: f64) -> EngineSpec {
    let mode = planner.editor_edit_format.as_deref().map(Mode::from).unwrap_or(Mode::Editor);
    let main = planner.editor_model.clone().unwrap_or_else(|| planner.name.clone());
    let selection = ModelSelection::new(main).with_weak(Some(planner.weak_model.clone()));

    let mut spec = EngineSpec::new(mode, selection).with_history(History::default());
    spec.suggest_shell_commands = false;
    spec.cache_prompts = false;
    spec.summarize_history = false;
    spec.repo_map = false;
    spec.total_cost = Some(total_cost);
    spec
}

pub struct EditorPass {
    factory: Arc<dyn EngineFactory>,
    pipe: StreamingPipe,
    sink: EventSink,
}

impl EditorPass {
    pub fn new(factory: Arc<dyn EngineFactory>, pipe: StreamingPipe, sink: EventSink) -> Self {
        Self { factory, pipe, sink }
    }

    /// Hand the planner's output to an editor engine and stream its run
    pub async fn run(&self, planner: &Arc<ExecutionHandle>, io: Arc<dyn EngineIo>) -> Result<PipeOutcome, SessionError> {
        debug!("EditorPass::run: called");
        let planner_engine = planner.engine().clone();
        let factory = self.factory.clone();
        let (editor, plan) = tokio::task::spawn_blocking(move || {
            let spec = editor_spec(&planner_engine.model(), planner_engine.total_cost());
            let editor = factory.create(spec, Some(&planner_engine), io)?;
            Ok::<_, crate::engine::EngineError>((editor, planner_engine.partial_response()))
        })
        .await??;

        let plan = if plan.is_empty() { planner.content() } else { plan };
        info!(plan_len = plan.len(), model = %editor.model().name, "EditorPass::run: starting editor");

        planner.hand_off();
        self.sink.response(ResponsePayload::planning_finished(plan.clone()));
        planner.set_content(String::new());

        let execution = Arc::new(ExecutionHandle::new(editor.clone()));
        let outcome = self.pipe.run(&execution, &plan, None).await?;

        // A cut-short edit is recorded as such, never as applied
        let closing = if outcome.interrupted {
            format!("{} (interrupted)", outcome.content)
        } else {
            EDITS_APPLIED_ACK.to_string()
        };
        let planner_engine = planner.engine().clone();
        tokio::task::spawn_blocking(move || {
            planner_engine.move_back_cur_messages(&closing);
            planner_engine.set_total_cost(editor.total_cost());
            planner_engine.set_commit_hashes(editor.commit_hashes());
        })
        .await?;

        debug!(interrupted = outcome.interrupted, "EditorPass::run: editor finished");
        Ok(outcome)
    }
}
