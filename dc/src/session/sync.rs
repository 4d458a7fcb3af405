//! Peer views of engine state
//!
//! After most actions the peer's picture of the session (context files,
//! autocompletion, repo map, models, token usage) is refreshed from the
//! primary engine. All reads here block, so callers run `send` on a
//! blocking thread.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineIo};
use crate::events::{EventSink, OutboundEvent};

/// One refreshable view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerView {
    ContextFiles,
    Autocompletion,
    RepoMap,
    Models,
    TokensInfo,
}

/// Session-level model settings reported when the engine has none
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOverrides {
    pub reasoning_effort: Option<String>,
    pub thinking_tokens: Option<String>,
}

pub struct PeerSync {
    sink: EventSink,
    io: Arc<dyn EngineIo>,
    known_models: Vec<String>,
}

impl PeerSync {
    pub fn new(sink: EventSink, io: Arc<dyn EngineIo>, mut known_models: Vec<String>) -> Self {
        known_models.sort();
        known_models.dedup();
        Self { sink, io, known_models }
    }

    pub fn send(&self, engine: &dyn Engine, views: &[PeerView], overrides: &ModelOverrides) {
        debug!(?views, "PeerSync::send: called");
        for view in views {
            match view {
                PeerView::ContextFiles => {
                    self.sink.context_files(engine.context_files());
                }
                PeerView::Autocompletion => self.autocompletion(engine),
                PeerView::RepoMap => {
                    if let Some(map) = engine.repo_map().filter(|m| !m.is_empty()) {
                        self.sink.repo_map(map);
                    }
                }
                PeerView::Models => {
                    self.sink.emit(models_event(engine, overrides));
                }
                PeerView::TokensInfo => {
                    self.sink.tokens_info(engine.tokens_info());
                }
            }
        }
    }

    fn autocompletion(&self, engine: &dyn Engine) {
        let (words, all_files) = match engine.autocompletion() {
            Ok(a) => (a.words, a.all_files),
            Err(e) => {
                warn!(error = %e, "PeerSync::autocompletion: failed");
                self.io.tool_error(&format!("Error in send_autocompletion: {}", e));
                (Vec::new(), Vec::new())
            }
        };
        self.sink.emit(OutboundEvent::UpdateAutocompletion {
            words,
            all_files,
            models: self.known_models.clone(),
        });
    }
}

/// The set-models event for an engine's current model
pub fn models_event(engine: &dyn Engine, overrides: &ModelOverrides) -> OutboundEvent {
    let model = engine.model();
    let error = (!model.missing_keys.is_empty())
        .then(|| format!("Missing keys for the model: {}", model.missing_keys.join(", ")));
    OutboundEvent::SetModels {
        main_model: model.name,
        weak_model: model.weak_model,
        reasoning_effort: model.reasoning_effort.or_else(|| overrides.reasoning_effort.clone()),
        thinking_tokens: model.thinking_tokens.or_else(|| overrides.thinking_tokens.clone()),
        info: model.info,
        error,
    }
}
