//! Shared harness for session integration tests
//!
//! A scripted engine and factory stand in for the LLM engine, and a `Peer`
//! drives a served session over an in-memory duplex.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deskconnector::config::SessionConfig;
use deskconnector::engine::{
    ChatMessage, ChunkSource, CommitInfo, ContextFile, Engine, EngineError, EngineFactory, EngineIo, EngineSpec,
    History, Mode, ModelInfo, ModelSelection, Question,
};
use deskconnector::events::EventSink;
use deskconnector::gateway::{ServeOptions, serve};
use deskconnector::session::Orchestrator;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// What an engine of one mode does on every run
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<String>,
    /// Ask to edit files once the reply is complete
    pub ask_edit: bool,
    pub commit: Option<CommitInfo>,
    /// Runs that end with a follow-up prompt
    pub reflections: usize,
    pub cost_per_run: f64,
}

impl Script {
    pub fn chunks(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    history: History,
    total_cost: f64,
    commit_hashes: Vec<String>,
    last_commit: Option<CommitInfo>,
    finished_runs: usize,
    files: Vec<ContextFile>,
}

pub struct ScriptedEngine {
    mode: Mode,
    model: ModelInfo,
    script: Script,
    io: Arc<dyn EngineIo>,
    state: Arc<Mutex<ScriptedState>>,
    runs: Arc<AtomicUsize>,
}

struct ScriptedSource {
    pending: VecDeque<String>,
    text: String,
    done: bool,
    script: Script,
    io: Arc<dyn EngineIo>,
    state: Arc<Mutex<ScriptedState>>,
}

impl ChunkSource for ScriptedSource {
    fn next_chunk(&mut self) -> Option<Result<String, EngineError>> {
        if let Some(chunk) = self.pending.pop_front() {
            self.text.push_str(&chunk);
            return Some(Ok(chunk));
        }
        if !self.done {
            self.done = true;
            {
                let mut state = self.state.lock().unwrap();
                state.history.cur.push(ChatMessage::assistant(self.text.clone()));
                state.history.move_back("");
                state.finished_runs += 1;
                state.total_cost += self.script.cost_per_run;
                if let Some(commit) = &self.script.commit {
                    state.commit_hashes.push(commit.hash.clone());
                    state.last_commit = Some(commit.clone());
                }
            }
            if self.script.ask_edit {
                self.io.confirm_ask(Question::edit_files());
            }
        }
        None
    }
}

impl ScriptedEngine {
    pub fn finished_runs(&self) -> usize {
        self.state.lock().unwrap().finished_runs
    }
}

impl Engine for ScriptedEngine {
    fn mode(&self) -> Mode {
        self.mode.clone()
    }

    fn model(&self) -> ModelInfo {
        self.model.clone()
    }

    fn run_stream(&self, prompt: &str) -> Box<dyn ChunkSource> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().history.cur.push(ChatMessage::user(prompt));
        Box::new(ScriptedSource {
            pending: self.script.chunks.iter().cloned().collect(),
            text: String::new(),
            done: false,
            script: self.script.clone(),
            io: self.io.clone(),
            state: self.state.clone(),
        })
    }

    fn partial_response(&self) -> String {
        String::new()
    }

    fn edited_files(&self) -> Vec<String> {
        Vec::new()
    }

    fn last_commit(&self) -> Option<CommitInfo> {
        self.state.lock().unwrap().last_commit.clone()
    }

    fn diff_commits(&self, from: &str, to: &str) -> Result<String, EngineError> {
        Ok(format!("diff {}..{}", from, to))
    }

    fn reflected_message(&self) -> Option<String> {
        let runs = self.state.lock().unwrap().finished_runs;
        (runs > 0 && runs <= self.script.reflections).then(|| "Fix the lint errors".to_string())
    }

    fn total_cost(&self) -> f64 {
        self.state.lock().unwrap().total_cost
    }

    fn set_total_cost(&self, cost: f64) {
        self.state.lock().unwrap().total_cost = cost;
    }

    fn commit_hashes(&self) -> Vec<String> {
        self.state.lock().unwrap().commit_hashes.clone()
    }

    fn set_commit_hashes(&self, hashes: Vec<String>) {
        self.state.lock().unwrap().commit_hashes = hashes;
    }

    fn history(&self) -> History {
        self.state.lock().unwrap().history.clone()
    }

    fn set_history(&self, history: History) {
        self.state.lock().unwrap().history = history;
    }

    fn context_files(&self) -> Vec<ContextFile> {
        self.state.lock().unwrap().files.clone()
    }

    fn add_file(&self, path: &str, read_only: bool) -> Result<(), EngineError> {
        self.state.lock().unwrap().files.push(ContextFile {
            path: path.to_string(),
            read_only,
        });
        Ok(())
    }

    fn drop_file(&self, path: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().files.retain(|f| f.path != path);
        Ok(())
    }
}

/// Builds scripted engines, one script per mode
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: HashMap<Mode, Script>,
    engines: Mutex<Vec<Arc<ScriptedEngine>>>,
    specs: Mutex<Vec<EngineSpec>>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, mode: Mode, script: Script) -> Self {
        self.scripts.insert(mode, script);
        self
    }

    /// Every engine created so far, oldest first
    pub fn engines(&self) -> Vec<Arc<ScriptedEngine>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn last_engine(&self) -> Arc<ScriptedEngine> {
        self.engines.lock().unwrap().last().cloned().unwrap()
    }

    pub fn specs(&self) -> Vec<EngineSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Total runs started across all engines
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(
        &self,
        spec: EngineSpec,
        from: Option<&Arc<dyn Engine>>,
        io: Arc<dyn EngineIo>,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        let mut state = ScriptedState::default();
        if let Some(from) = from {
            state.history = from.history();
            state.total_cost = from.total_cost();
            state.commit_hashes = from.commit_hashes();
            state.files = from.context_files();
        }
        if let Some(history) = spec.history.clone() {
            state.history = history;
        }
        if let Some(cost) = spec.total_cost {
            state.total_cost = cost;
        }

        let engine = Arc::new(ScriptedEngine {
            mode: spec.mode.clone(),
            model: ModelInfo {
                name: spec.model.main.clone(),
                weak_model: spec.model.weak.clone().unwrap_or_else(|| "scripted-weak".to_string()),
                editor_model: spec.model.editor.clone(),
                reasoning_effort: spec.reasoning_effort.clone(),
                thinking_tokens: spec.thinking_tokens.clone(),
                ..Default::default()
            },
            script: self.scripts.get(&spec.mode).cloned().unwrap_or_default(),
            io,
            state: Arc::new(Mutex::new(state)),
            runs: self.runs.clone(),
        });
        self.specs.lock().unwrap().push(spec);
        self.engines.lock().unwrap().push(engine.clone());
        Ok(engine as Arc<dyn Engine>)
    }

    fn check_model(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }

    fn known_models(&self) -> Vec<String> {
        vec!["scripted-main".to_string(), "scripted-planner".to_string()]
    }
}

pub fn settings(chunk_yield_ms: u64, max_reflections: u32) -> SessionConfig {
    SessionConfig {
        max_reflections,
        chunk_yield_ms,
        confirmation_poll_ms: 20,
        action_delay_ms: 0,
        ..Default::default()
    }
}

/// The remote end of a served session
pub struct Peer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    server: JoinHandle<eyre::Result<()>>,
}

impl Peer {
    pub async fn start(factory: Arc<ScriptedFactory>, settings: SessionConfig) -> Self {
        let (sink, events) = EventSink::channel();
        let spec = EngineSpec::new(
            Mode::Code,
            ModelSelection::new("scripted-main").with_weak(Some("scripted-weak".to_string())),
        );
        let orchestrator = Orchestrator::new(factory, spec, sink.clone(), settings, PathBuf::from("/work/repo"))
            .await
            .expect("orchestrator");

        let (local, remote) = tokio::io::duplex(256 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let server = tokio::spawn(serve(
            local_read,
            local_write,
            orchestrator,
            sink,
            events,
            ServeOptions::default(),
        ));

        let (remote_read, writer) = tokio::io::split(remote);
        Self {
            lines: BufReader::new(remote_read).lines(),
            writer,
            server,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.expect("send");
    }

    pub async fn next_event(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("timed out waiting for an event")
            .expect("read failed")
            .expect("session closed");
        serde_json::from_str(&line).expect("event is JSON")
    }

    /// Events up to and including the first with `action`
    pub async fn read_until(&mut self, action: &str) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = event["action"] == action;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// Hang up and wait for the session to wind down
    ///
    /// Events still queued when the peer goes away fail to write, so the
    /// serve result itself is not checked.
    pub async fn close(self) {
        drop(self.writer);
        drop(self.lines);
        let joined = tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("session did not end");
        assert!(joined.is_ok(), "server task panicked");
    }
}

/// Terminal `response` events
pub fn terminals(events: &[Value]) -> Vec<&Value> {
    events
        .iter()
        .filter(|e| e["action"] == "response" && e["finished"] == true)
        .collect()
}

/// Non-terminal `response` events
pub fn progress(events: &[Value]) -> Vec<&Value> {
    events
        .iter()
        .filter(|e| e["action"] == "response" && e["finished"] == false)
        .collect()
}
