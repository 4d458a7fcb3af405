//! Test doubles for the engine interface

use std::sync::{Arc, Mutex};

use crate::engine::{
    ChunkSource, CommitInfo, ContextFile, Engine, EngineError, EngineFactory, EngineIo, EngineSpec, History, Mode,
    ModelInfo,
};

type SourceFn = Box<dyn Fn() -> Box<dyn ChunkSource> + Send + Sync>;

/// Engine whose every run replays a scripted chunk source
pub struct FakeEngine {
    source: SourceFn,
    partial: String,
    edited: Vec<String>,
    commit: Option<CommitInfo>,
    history: Mutex<History>,
    cost: Mutex<f64>,
}

impl FakeEngine {
    pub fn with_source<F>(source: F) -> Self
    where
        F: Fn() -> Box<dyn ChunkSource> + Send + Sync + 'static,
    {
        Self {
            source: Box::new(source),
            partial: String::new(),
            edited: Vec::new(),
            commit: None,
            history: Mutex::new(History::default()),
            cost: Mutex::new(0.0),
        }
    }

    pub fn streaming(chunks: Vec<&str>) -> Self {
        let chunks: Vec<String> = chunks.into_iter().map(String::from).collect();
        Self::with_source(move || -> Box<dyn ChunkSource> {
            Box::new(chunks.clone().into_iter().map(Ok::<_, EngineError>))
        })
    }

    /// Produces no chunks, only a partial response
    pub fn silent(partial: &str) -> Self {
        let mut engine = Self::with_source(|| -> Box<dyn ChunkSource> {
            Box::new(std::iter::empty::<Result<String, EngineError>>())
        });
        engine.partial = partial.to_string();
        engine
    }

    pub fn with_edited(mut self, paths: Vec<&str>) -> Self {
        self.edited = paths.into_iter().map(String::from).collect();
        self
    }

    pub fn with_commit(mut self, hash: &str, message: &str) -> Self {
        self.commit = Some(CommitInfo {
            hash: hash.to_string(),
            message: message.to_string(),
        });
        self
    }
}

impl Engine for FakeEngine {
    fn mode(&self) -> Mode {
        Mode::Code
    }

    fn model(&self) -> ModelInfo {
        ModelInfo {
            name: "fake".to_string(),
            weak_model: "fake".to_string(),
            ..Default::default()
        }
    }

    fn run_stream(&self, _prompt: &str) -> Box<dyn ChunkSource> {
        (self.source)()
    }

    fn partial_response(&self) -> String {
        self.partial.clone()
    }

    fn edited_files(&self) -> Vec<String> {
        self.edited.clone()
    }

    fn last_commit(&self) -> Option<CommitInfo> {
        self.commit.clone()
    }

    fn diff_commits(&self, from: &str, to: &str) -> Result<String, EngineError> {
        Ok(format!("diff {}..{}", from, to))
    }

    fn total_cost(&self) -> f64 {
        *self.cost.lock().unwrap()
    }

    fn set_total_cost(&self, cost: f64) {
        *self.cost.lock().unwrap() = cost;
    }

    fn history(&self) -> History {
        self.history.lock().unwrap().clone()
    }

    fn set_history(&self, history: History) {
        *self.history.lock().unwrap() = history;
    }

    fn context_files(&self) -> Vec<ContextFile> {
        Vec::new()
    }

    fn add_file(&self, _path: &str, _read_only: bool) -> Result<(), EngineError> {
        Ok(())
    }

    fn drop_file(&self, _path: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Factory handing out streaming fakes and recording every spec it saw
#[derive(Default)]
pub struct FakeFactory {
    chunks: Vec<String>,
    pub specs: Mutex<Vec<EngineSpec>>,
}

impl FakeFactory {
    pub fn streaming(chunks: Vec<&str>) -> Self {
        Self {
            chunks: chunks.into_iter().map(String::from).collect(),
            specs: Mutex::new(Vec::new()),
        }
    }
}

impl EngineFactory for FakeFactory {
    fn create(
        &self,
        spec: EngineSpec,
        from: Option<&Arc<dyn Engine>>,
        _io: Arc<dyn EngineIo>,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        let engine = FakeEngine::streaming(self.chunks.iter().map(String::as_str).collect());
        let history = spec
            .history
            .clone()
            .or_else(|| from.map(|f| f.history()))
            .unwrap_or_default();
        engine.set_history(history);
        engine.set_total_cost(spec.total_cost.or_else(|| from.map(|f| f.total_cost())).unwrap_or(0.0));
        self.specs.lock().unwrap().push(spec);
        Ok(Arc::new(engine))
    }

    fn check_model(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }

    fn known_models(&self) -> Vec<String> {
        vec!["fake".to_string()]
    }
}
