//! LlmEngine - the reference engine over the streaming LLM clients
//!
//! A small, honest engine: it keeps a chat history, sends it to the model
//! with the in-chat files, streams the reply back as chunks and, in the
//! editing modes, writes whole-file edits found in the reply. Architect mode
//! asks for confirmation before handing its plan to an editor pass.
//!
//! All methods block; the runtime handle is only used to drive the async
//! clients from blocking threads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use tokio::runtime::Handle;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    Autocompletion, ChatMessage, ChunkSource, ContextFile, Engine, EngineError, EngineFactory, EngineIo, EngineSpec,
    FileEdit, History, Mode, ModelCatalog, ModelEntry, ModelInfo, ModelSelection, Question, Role, TokenCost,
    TokensInfo, Workspace, parse_whole_file_edits,
};
use crate::config::{EngineConfig, LlmConfig};
use crate::llm::{
    ChatReply, ChatRequest, ClientSettings, LlmClient, ReplyEvent, ReplyStream, Speaker, Turn, Usage, create_client,
};

/// Acknowledgement recorded after an editor pass applied a plan
pub const EDITS_APPLIED_ACK: &str = "I made those changes to the files.";

const SYSTEM_TEMPLATE: &str = r#"Act as an expert software developer working in the repository at {{base_dir}}.
{{instructions}}
{{#if suggest_shell}}
When a shell command would help the user, suggest it in a ```bash block.
{{/if}}
{{#if repo_map}}

These files exist in the repository:
{{repo_map}}
{{/if}}
{{#each files}}

{{#if read_only}}Read-only reference file{{else}}File you may edit{{/if}}: {{path}}
```
{{content}}
```
{{/each}}"#;

const WHOLE_FILE_RULES: &str = "For every file you change, reply with the file's path on its own line \
followed by a fenced code block holding the complete new content of the file.";

fn instructions(mode: &Mode) -> String {
    match mode {
        Mode::Code => format!("Make the changes the user asks for. {}", WHOLE_FILE_RULES),
        Mode::Editor => format!("Apply the plan you are given exactly. {}", WHOLE_FILE_RULES),
        Mode::Architect => "Describe precisely how to change the code to fulfil the request. \
An editor engineer will apply your plan, so explain each change but do not write out whole files."
            .to_string(),
        Mode::Ask | Mode::Other(_) => "Answer questions about the code. Do not edit any files.".to_string(),
    }
}

#[derive(Serialize)]
struct PromptFile {
    path: String,
    read_only: bool,
    content: String,
}

#[derive(Serialize)]
struct PromptContext {
    base_dir: String,
    instructions: String,
    suggest_shell: bool,
    repo_map: Option<String>,
    files: Vec<PromptFile>,
}

/// Rough token estimate: four characters per token
fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn format_tokens(count: u64) -> String {
    match count {
        0..1_000 => count.to_string(),
        1_000..10_000 => format!("{:.1}k", count as f64 / 1_000.0),
        _ => format!("{}k", (count as f64 / 1_000.0).round() as u64),
    }
}

/// Parse a thinking budget such as `4096`, `8k` or `1.5k`
pub fn parse_token_budget(value: &str) -> Option<u32> {
    let value = value.trim().to_lowercase();
    let (number, multiplier) = match value.strip_suffix('k') {
        Some(n) => (n, 1_000.0),
        None => match value.strip_suffix('m') {
            Some(n) => (n, 1_000_000.0),
            None => (value.as_str(), 1.0),
        },
    };
    let parsed: f64 = number.trim().parse().ok()?;
    (parsed >= 0.0).then(|| (parsed * multiplier).round() as u32)
}

/// Merge consecutive same-role messages and drop leading assistant turns
fn request_turns(messages: &[ChatMessage]) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for message in messages {
        let speaker = match message.role {
            Role::Assistant => Speaker::Assistant,
            Role::User | Role::System => Speaker::User,
        };
        if turns.is_empty() && speaker == Speaker::Assistant {
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.speaker == speaker => {
                last.text.push_str("\n\n");
                last.text.push_str(&message.content);
            }
            _ => turns.push(Turn {
                speaker,
                text: message.content.clone(),
            }),
        }
    }
    turns
}

#[derive(Debug, Default)]
struct EngineState {
    history: History,
    /// path -> read-only
    files: BTreeMap<String, bool>,
    total_cost: f64,
    commit_hashes: Vec<String>,
    partial_response: String,
    edited_files: Vec<String>,
    usage_report: Option<String>,
    reflected_message: Option<String>,
    reasoning_effort: Option<String>,
    thinking_tokens: Option<String>,
}

struct EngineInner {
    mode: Mode,
    entry: ModelEntry,
    weak_model: String,
    editor_model: Option<String>,
    editor_edit_format: Option<String>,
    suggest_shell_commands: bool,
    summarize_history: bool,
    repo_map_enabled: bool,
    catalog: ModelCatalog,
    llm: LlmConfig,
    engine_config: EngineConfig,
    workspace: Workspace,
    io: Arc<dyn EngineIo>,
    runtime: Handle,
    client_override: Option<Arc<dyn LlmClient>>,
    templates: Handlebars<'static>,
    state: Mutex<EngineState>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, entry: &ModelEntry) -> Result<Arc<dyn LlmClient>, EngineError> {
        if let Some(client) = &self.client_override {
            return Ok(client.clone());
        }
        let provider = self
            .llm
            .provider(&entry.provider)
            .ok_or_else(|| EngineError::UnknownModel(entry.name.clone()))?;
        let settings = ClientSettings {
            provider: entry.provider.clone(),
            model: entry.name.clone(),
            api_key: provider.api_key()?,
            base_url: provider.base_url.clone(),
            max_tokens: self.engine_config.max_tokens,
            timeout_ms: self.engine_config.timeout_ms,
        };
        Ok(create_client(&settings)?)
    }

    fn repo_map_text(&self) -> Option<String> {
        if !self.repo_map_enabled {
            return None;
        }
        let files = self.workspace.list_files();
        (!files.is_empty()).then(|| files.join("\n"))
    }

    fn prompt_files(&self) -> Vec<PromptFile> {
        let files = self.lock().files.clone();
        files
            .into_iter()
            .filter_map(|(path, read_only)| match self.workspace.read(&path) {
                Ok(content) => Some(PromptFile {
                    path,
                    read_only,
                    content,
                }),
                Err(e) => {
                    warn!(%path, error = %e, "prompt_files: skipping unreadable file");
                    None
                }
            })
            .collect()
    }

    fn system_prompt(&self, mode: &Mode) -> Result<String, EngineError> {
        debug!(%mode, "EngineInner::system_prompt: called");
        let context = PromptContext {
            base_dir: self.workspace.base_dir().display().to_string(),
            instructions: instructions(mode),
            suggest_shell: self.suggest_shell_commands,
            repo_map: self.repo_map_text(),
            files: self.prompt_files(),
        };
        self.templates
            .render_template(SYSTEM_TEMPLATE, &context)
            .map_err(|e| EngineError::Other(format!("Failed to render system prompt: {}", e)))
    }

    fn request(&self, system: String, turns: Vec<Turn>) -> ChatRequest {
        let state = self.lock();
        ChatRequest {
            system,
            turns,
            max_tokens: self.engine_config.max_tokens,
            reasoning_effort: state.reasoning_effort.clone(),
            thinking_budget: state.thinking_tokens.as_deref().and_then(parse_token_budget),
        }
    }

    /// Drop the oldest settled exchanges until the history fits its budget
    fn trim_history(&self) {
        if !self.summarize_history {
            return;
        }
        let budget = self.entry.max_input_tokens / 4;
        let mut state = self.lock();
        let mut dropped = 0;
        while state.history.done.len() >= 2
            && state.history.all().iter().map(|m| estimate_tokens(&m.content)).sum::<u64>() > budget
        {
            state.history.done.drain(..2);
            dropped += 2;
        }
        if dropped > 0 {
            debug!(%dropped, "EngineInner::trim_history: dropped old messages");
        }
    }

    fn record_usage(&self, entry: &ModelEntry, usage: &Usage) {
        let cost = usage.price(entry.input_cost_per_token, entry.output_cost_per_token);
        let mut state = self.lock();
        state.total_cost += cost;
        state.usage_report = Some(format!(
            "Tokens: {} sent, {} received. Cost: ${:.2} message, ${:.2} session.",
            format_tokens(usage.prompt_total()),
            format_tokens(usage.completion),
            cost,
            state.total_cost
        ));
        debug!(%cost, total = state.total_cost, "EngineInner::record_usage: recorded");
    }

    /// Write whole-file edits found in `reply`, returning failure descriptions
    fn apply_reply_edits(&self, reply: &str) -> Vec<String> {
        let edits = parse_whole_file_edits(reply);
        debug!(count = edits.len(), "EngineInner::apply_reply_edits: called");
        let mut failures = Vec::new();

        for edit in edits {
            let is_new = !self.workspace.exists(&edit.path);
            if is_new && !self.io.confirm_ask(Question::create_file(&edit.path)) {
                debug!(path = %edit.path, "EngineInner::apply_reply_edits: creation declined");
                self.io.tool_warning(&format!("Skipping edits to {}", edit.path));
                continue;
            }

            match self.workspace.write(&edit.path, &edit.content) {
                Ok(()) => {
                    let mut state = self.lock();
                    if !state.edited_files.contains(&edit.path) {
                        state.edited_files.push(edit.path.clone());
                    }
                    state.files.entry(edit.path.clone()).or_insert(false);
                    drop(state);
                    self.io.tool_output(&format!("Applied edit to {}", edit.path));
                }
                Err(e) => {
                    debug!(path = %edit.path, error = %e, "EngineInner::apply_reply_edits: write failed");
                    self.io.tool_error(&format!("Failed to apply edit to {}: {}", edit.path, e));
                    failures.push(format!("{}: {}", edit.path, e));
                }
            }
        }

        failures
    }

    /// Bookkeeping once a streamed reply is complete
    fn finish_run(&self, finished: ChatReply) -> Result<(), EngineError> {
        debug!(mode = %self.mode, len = finished.text.len(), finish = ?finished.finish, "EngineInner::finish_run: called");
        let ChatReply { text: reply, usage, .. } = finished;
        {
            let mut state = self.lock();
            state.partial_response = reply.clone();
            state.history.cur.push(ChatMessage::assistant(reply.clone()));
            state.history.move_back("");
        }
        self.record_usage(&self.entry, &usage);

        match self.mode {
            Mode::Code | Mode::Editor => {
                let failures = self.apply_reply_edits(&reply);
                if !failures.is_empty() {
                    debug!("EngineInner::finish_run: edits failed, requesting reflection");
                    self.lock().reflected_message = Some(format!(
                        "These edits could not be applied:\n{}\nPlease fix the problems and try again.",
                        failures.join("\n")
                    ));
                }
            }
            Mode::Architect => {
                if !reply.trim().is_empty() && self.io.confirm_ask(Question::edit_files()) {
                    debug!("EngineInner::finish_run: plan approved, running editor pass");
                    self.run_editor_pass(&reply)?;
                }
            }
            Mode::Ask | Mode::Other(_) => {}
        }

        Ok(())
    }

    /// Apply an approved architect plan with the editor model
    fn run_editor_pass(&self, plan: &str) -> Result<(), EngineError> {
        let editor = self.editor_model.clone().unwrap_or_else(|| self.entry.name.clone());
        debug!(%editor, "EngineInner::run_editor_pass: called");
        let entry = self.catalog.resolve(&editor);
        let client = self.client(&entry)?;
        let system_prompt = self.system_prompt(&Mode::Editor)?;
        let request = self.request(system_prompt, vec![Turn::user(plan)]);

        let reply = self.runtime.block_on(client.reply(request))?;
        self.record_usage(&entry, &reply.usage);

        let failures = self.apply_reply_edits(&reply.text);
        if !failures.is_empty() {
            self.lock().reflected_message = Some(format!(
                "These edits could not be applied:\n{}\nPlease fix the problems and try again.",
                failures.join("\n")
            ));
        }
        self.lock().history.move_back(EDITS_APPLIED_ACK);
        Ok(())
    }

    fn add_file(&self, path: &str, read_only: bool) -> Result<(), EngineError> {
        debug!(%path, %read_only, "EngineInner::add_file: called");
        let resolved = self.workspace.resolve(path)?;
        if !resolved.is_file() {
            return Err(EngineError::FileNotFound(path.to_string()));
        }
        let rel = self.workspace.relative(&resolved);

        let mut state = self.lock();
        let existing = state.files.get(&rel).copied();
        match existing {
            Some(true) if read_only => {
                drop(state);
                self.io
                    .tool_error(&format!("{} is already in the chat as a read-only file", rel));
            }
            Some(false) if !read_only => {
                drop(state);
                self.io
                    .tool_error(&format!("{} is already in the chat as an editable file", rel));
            }
            _ => {
                state.files.insert(rel.clone(), read_only);
                drop(state);
                let kind = if read_only { " as read-only" } else { "" };
                self.io.tool_output(&format!("Added {} to the chat{}", rel, kind));
            }
        }
        Ok(())
    }

    fn drop_file(&self, path: &str) -> Result<(), EngineError> {
        debug!(%path, "EngineInner::drop_file: called");
        let rel = match self.workspace.resolve(path) {
            Ok(resolved) => self.workspace.relative(&resolved),
            Err(_) => path.to_string(),
        };
        let removed = self.lock().files.remove(&rel).is_some();
        if removed {
            self.io.tool_output(&format!("Removed {} from the chat", rel));
        } else {
            self.io.tool_error(&format!("No files matched '{}'", path));
        }
        Ok(())
    }

    fn run_shell_command(&self, command: &str) -> Result<(), EngineError> {
        debug!(%command, "EngineInner::run_shell_command: called");
        let result = self.workspace.run_shell(command)?;
        for line in result.output.lines() {
            self.io.tool_output(line);
        }
        if result.exit_code != 0 {
            self.io
                .tool_output(&format!("Command exited with status {}", result.exit_code));
        }

        if !result.output.trim().is_empty() && self.io.confirm_ask(Question::add_command_output()) {
            debug!("EngineInner::run_shell_command: adding output to history");
            let mut state = self.lock();
            state.history.done.push(ChatMessage::user(format!(
                "I ran this command:\n\n{}\n\nAnd got this output:\n\n{}",
                command, result.output
            )));
            state.history.done.push(ChatMessage::assistant("Ok."));
        }
        Ok(())
    }

    fn tokens_info(&self) -> TokensInfo {
        let cpt = self.entry.input_cost_per_token;
        let system = self.system_prompt(&self.mode).unwrap_or_default();
        let history: u64 = self
            .lock()
            .history
            .all()
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();
        let repo_map = self.repo_map_text().map(|m| estimate_tokens(&m)).unwrap_or(0);

        let files = self
            .prompt_files()
            .into_iter()
            .map(|f| (f.path, TokenCost::new(estimate_tokens(&f.content), cpt)))
            .collect();

        TokensInfo {
            system_messages: TokenCost::new(estimate_tokens(&system), cpt),
            chat_history: TokenCost::new(history, cpt),
            repo_map: TokenCost::new(repo_map, cpt),
            files,
        }
    }
}

enum Stage {
    Pending(Arc<dyn LlmClient>, ChatRequest),
    Open(ReplyStream),
    Done,
}

/// Drives the client's reply stream from a blocking thread
///
/// The request is only sent on the first pull.
struct LlmChunkSource {
    inner: Arc<EngineInner>,
    stage: Stage,
}

impl ChunkSource for LlmChunkSource {
    fn next_chunk(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            match std::mem::replace(&mut self.stage, Stage::Done) {
                Stage::Done => return None,
                Stage::Pending(client, request) => match self.inner.runtime.block_on(client.reply_stream(request)) {
                    Ok(stream) => self.stage = Stage::Open(stream),
                    Err(e) => {
                        debug!(error = %e, "LlmChunkSource::next_chunk: request failed");
                        return Some(Err(e.into()));
                    }
                },
                Stage::Open(mut stream) => {
                    return match self.inner.runtime.block_on(stream.next()) {
                        Some(Ok(ReplyEvent::Text(text))) => {
                            self.inner.lock().partial_response.push_str(&text);
                            self.stage = Stage::Open(stream);
                            Some(Ok(text))
                        }
                        Some(Ok(ReplyEvent::Finished(reply))) => self.inner.finish_run(reply).err().map(Err),
                        Some(Err(e)) => Some(Err(e.into())),
                        None => Some(Err(EngineError::Other("Reply stream closed early".to_string()))),
                    };
                }
            }
        }
    }
}

/// Reference engine backed by an LLM provider
pub struct LlmEngine {
    inner: Arc<EngineInner>,
}

impl Engine for LlmEngine {
    fn mode(&self) -> Mode {
        self.inner.mode.clone()
    }

    fn model(&self) -> ModelInfo {
        let inner = &self.inner;
        let state = inner.lock();
        ModelInfo {
            name: inner.entry.name.clone(),
            weak_model: inner.weak_model.clone(),
            editor_model: inner.editor_model.clone(),
            editor_edit_format: inner.editor_edit_format.clone(),
            reasoning_effort: state.reasoning_effort.clone(),
            thinking_tokens: state.thinking_tokens.clone(),
            info: inner.entry.info(),
            missing_keys: inner.catalog.missing_keys(&inner.entry.name, &inner.llm),
            input_cost_per_token: inner.entry.input_cost_per_token,
        }
    }

    fn run_stream(&self, prompt: &str) -> Box<dyn ChunkSource> {
        debug!(mode = %self.inner.mode, prompt_len = prompt.len(), "LlmEngine::run_stream: called");
        {
            let mut state = self.inner.lock();
            state.partial_response.clear();
            state.edited_files.clear();
            state.usage_report = None;
            state.reflected_message = None;
            state.history.cur.push(ChatMessage::user(prompt));
        }
        self.inner.trim_history();

        let prepared = self.inner.client(&self.inner.entry).and_then(|client| {
            let system_prompt = self.inner.system_prompt(&self.inner.mode)?;
            let turns = request_turns(&self.inner.lock().history.all());
            Ok((client, self.inner.request(system_prompt, turns)))
        });
        let (client, request) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(error = %e, "LlmEngine::run_stream: failed to prepare request");
                return Box::new(std::iter::once(Err::<String, EngineError>(e)));
            }
        };

        Box::new(LlmChunkSource {
            inner: self.inner.clone(),
            stage: Stage::Pending(client, request),
        })
    }

    fn partial_response(&self) -> String {
        self.inner.lock().partial_response.clone()
    }

    fn edited_files(&self) -> Vec<String> {
        self.inner.lock().edited_files.clone()
    }

    fn usage_report(&self) -> Option<String> {
        self.inner.lock().usage_report.clone()
    }

    fn reflected_message(&self) -> Option<String> {
        self.inner.lock().reflected_message.clone()
    }

    fn total_cost(&self) -> f64 {
        self.inner.lock().total_cost
    }

    fn set_total_cost(&self, cost: f64) {
        self.inner.lock().total_cost = cost;
    }

    fn commit_hashes(&self) -> Vec<String> {
        self.inner.lock().commit_hashes.clone()
    }

    fn set_commit_hashes(&self, hashes: Vec<String>) {
        self.inner.lock().commit_hashes = hashes;
    }

    fn history(&self) -> History {
        self.inner.lock().history.clone()
    }

    fn set_history(&self, history: History) {
        self.inner.lock().history = history;
    }

    fn context_files(&self) -> Vec<ContextFile> {
        self.inner
            .lock()
            .files
            .iter()
            .map(|(path, read_only)| ContextFile {
                path: path.clone(),
                read_only: *read_only,
            })
            .collect()
    }

    fn add_file(&self, path: &str, read_only: bool) -> Result<(), EngineError> {
        self.inner.add_file(path, read_only)
    }

    fn drop_file(&self, path: &str) -> Result<(), EngineError> {
        self.inner.drop_file(path)
    }

    fn apply_edits(&self, edits: &[FileEdit]) -> Result<(), EngineError> {
        debug!(count = edits.len(), "LlmEngine::apply_edits: called");
        for edit in edits {
            self.inner.workspace.apply_edit(edit)?;
            let mut state = self.inner.lock();
            if !state.edited_files.contains(&edit.path) {
                state.edited_files.push(edit.path.clone());
            }
        }
        Ok(())
    }

    fn run_command(&self, command: &str) -> Result<(), EngineError> {
        debug!(%command, "LlmEngine::run_command: called");
        let trimmed = command.trim();
        let (name, args) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
        let args = args.trim();

        match name {
            "/clear" => {
                self.inner.lock().history = History::default();
                self.inner.io.tool_output("All chat history cleared.");
            }
            "/tokens" => {
                let info = self.inner.tokens_info();
                let total = info.system_messages.tokens
                    + info.chat_history.tokens
                    + info.repo_map.tokens
                    + info.files.values().map(|f| f.tokens).sum::<u64>();
                self.inner.io.tool_output(&format!(
                    "{} tokens system messages",
                    format_tokens(info.system_messages.tokens)
                ));
                self.inner
                    .io
                    .tool_output(&format!("{} tokens chat history", format_tokens(info.chat_history.tokens)));
                self.inner
                    .io
                    .tool_output(&format!("{} tokens repository map", format_tokens(info.repo_map.tokens)));
                for (path, cost) in &info.files {
                    self.inner
                        .io
                        .tool_output(&format!("{} tokens {}", format_tokens(cost.tokens), path));
                }
                self.inner
                    .io
                    .tool_output(&format!("{} tokens total", format_tokens(total)));
            }
            "/add" | "/read-only" => {
                let read_only = name == "/read-only";
                for path in args.split_whitespace() {
                    let path = path.trim_matches('"');
                    if let Err(e) = self.inner.add_file(path, read_only) {
                        self.inner.io.tool_error(&e.to_string());
                    }
                }
            }
            "/drop" => {
                if args.is_empty() {
                    self.inner.lock().files.clear();
                    self.inner.io.tool_output("Dropping all files from the chat session.");
                } else {
                    for path in args.split_whitespace() {
                        self.inner.drop_file(path.trim_matches('"'))?;
                    }
                }
            }
            "/run" | "/test" => {
                if args.is_empty() {
                    return Err(EngineError::InvalidCommand(format!("{} needs a command", name)));
                }
                self.inner.run_shell_command(args)?;
            }
            "/reasoning-effort" => {
                let value = (!args.is_empty()).then(|| args.to_string());
                self.set_reasoning_effort(value);
            }
            "/think-tokens" => {
                let value = (!args.is_empty()).then(|| args.to_string());
                self.set_thinking_tokens(value);
            }
            "/map-refresh" => {}
            _ => {
                debug!(%name, "LlmEngine::run_command: unsupported command");
                self.inner.io.tool_error(&format!("Invalid command: {}", name));
            }
        }
        Ok(())
    }

    fn announcements(&self) -> Vec<String> {
        let inner = &self.inner;
        let mut lines = vec![
            format!("Model: {} with {} edit format", inner.entry.name, inner.mode),
            format!("Weak model: {}", inner.weak_model),
        ];
        if let Some(editor) = &inner.editor_model {
            let format = inner.editor_edit_format.as_deref().unwrap_or("editor-whole");
            lines.push(format!("Editor model: {} with {} edit format", editor, format));
        }
        if inner.repo_map_enabled {
            lines.push(format!("Repo-map: {} files", inner.workspace.list_files().len()));
        } else {
            lines.push("Repo-map: disabled".to_string());
        }
        lines
    }

    fn repo_map(&self) -> Option<String> {
        self.inner.repo_map_text()
    }

    fn autocompletion(&self) -> Result<Autocompletion, EngineError> {
        debug!("LlmEngine::autocompletion: called");
        let identifier = Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}")
            .map_err(|e| EngineError::Other(format!("Invalid identifier pattern: {}", e)))?;

        let mut words = BTreeSet::new();
        for file in self.inner.prompt_files() {
            if let Some(name) = file.path.rsplit('/').next() {
                words.insert(name.to_string());
            }
            for m in identifier.find_iter(&file.content) {
                words.insert(m.as_str().to_string());
            }
        }

        Ok(Autocompletion {
            words: words.into_iter().collect(),
            all_files: self.inner.workspace.list_files(),
        })
    }

    fn tokens_info(&self) -> TokensInfo {
        self.inner.tokens_info()
    }

    fn set_reasoning_effort(&self, effort: Option<String>) {
        debug!(?effort, "LlmEngine::set_reasoning_effort: called");
        self.inner.lock().reasoning_effort = effort;
    }

    fn set_thinking_tokens(&self, tokens: Option<String>) {
        debug!(?tokens, "LlmEngine::set_thinking_tokens: called");
        self.inner.lock().thinking_tokens = tokens;
    }
}

/// Builds [`LlmEngine`]s from the configuration
pub struct LlmEngineFactory {
    catalog: ModelCatalog,
    llm: LlmConfig,
    engine_config: EngineConfig,
    workspace: Workspace,
    runtime: Handle,
    client_override: Option<Arc<dyn LlmClient>>,
}

impl LlmEngineFactory {
    pub fn new(
        catalog: ModelCatalog,
        llm: LlmConfig,
        engine_config: EngineConfig,
        workspace: Workspace,
        runtime: Handle,
    ) -> Self {
        debug!(base_dir = ?workspace.base_dir(), "LlmEngineFactory::new: called");
        Self {
            catalog,
            llm,
            engine_config,
            workspace,
            runtime,
            client_override: None,
        }
    }

    /// Route every engine through `client` instead of a provider client
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    /// Spec for the session's primary engine as configured
    pub fn primary_spec(&self, reasoning_effort: Option<String>, thinking_tokens: Option<String>) -> EngineSpec {
        let config = &self.engine_config;
        let mut model = ModelSelection::new(config.main_model.clone())
            .with_weak(config.weak_model.clone())
            .with_editor(config.editor_model.clone());
        model.editor_edit_format = config.editor_edit_format.clone();

        let mut spec = EngineSpec::new(Mode::from(config.edit_format.as_str()), model);
        spec.reasoning_effort = reasoning_effort;
        spec.thinking_tokens = thinking_tokens;
        spec
    }
}

impl EngineFactory for LlmEngineFactory {
    fn create(
        &self,
        spec: EngineSpec,
        from: Option<&Arc<dyn Engine>>,
        io: Arc<dyn EngineIo>,
    ) -> Result<Arc<dyn Engine>, EngineError> {
        debug!(mode = %spec.mode, model = %spec.model.main, inherits = from.is_some(), "LlmEngineFactory::create: called");
        let entry = self.catalog.resolve(&spec.model.main);
        let weak_model = spec
            .model
            .weak
            .clone()
            .or_else(|| entry.weak_model.clone())
            .unwrap_or_else(|| entry.name.clone());
        let editor_model = spec.model.editor.clone().or_else(|| entry.editor_model.clone());
        let editor_edit_format = spec
            .model
            .editor_edit_format
            .clone()
            .or_else(|| entry.editor_edit_format.clone());

        let mut state = EngineState {
            reasoning_effort: spec.reasoning_effort.clone(),
            thinking_tokens: spec.thinking_tokens.clone(),
            ..Default::default()
        };

        if let Some(from) = from {
            state.history = from.history();
            state.total_cost = from.total_cost();
            state.commit_hashes = from.commit_hashes();
            state.files = from
                .context_files()
                .into_iter()
                .map(|f| (f.path, f.read_only))
                .collect();
            let source = from.model();
            state.reasoning_effort = state.reasoning_effort.or(source.reasoning_effort);
            state.thinking_tokens = state.thinking_tokens.or(source.thinking_tokens);
        }
        if let Some(history) = spec.history {
            state.history = history;
        }
        if let Some(cost) = spec.total_cost {
            state.total_cost = cost;
        }

        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);

        info!(model = %entry.name, mode = %spec.mode, "LlmEngineFactory::create: engine ready");
        Ok(Arc::new(LlmEngine {
            inner: Arc::new(EngineInner {
                mode: spec.mode,
                entry,
                weak_model,
                editor_model,
                editor_edit_format,
                suggest_shell_commands: spec.suggest_shell_commands,
                summarize_history: spec.summarize_history,
                repo_map_enabled: spec.repo_map,
                catalog: self.catalog.clone(),
                llm: self.llm.clone(),
                engine_config: self.engine_config.clone(),
                workspace: self.workspace.clone(),
                io,
                runtime: self.runtime.clone(),
                client_override: self.client_override.clone(),
                templates,
                state: Mutex::new(state),
            }),
        }))
    }

    fn check_model(&self, name: &str) -> Vec<String> {
        self.catalog.check_model(name, &self.llm)
    }

    fn known_models(&self) -> Vec<String> {
        self.catalog.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::QuestionKind;
    use crate::llm::client::mock::MockLlmClient;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingIo {
        answer: bool,
        outputs: Mutex<Vec<String>>,
        warnings: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
        questions: Mutex<Vec<Question>>,
    }

    impl RecordingIo {
        fn answering(answer: bool) -> Arc<Self> {
            Arc::new(Self {
                answer,
                ..Default::default()
            })
        }
    }

    impl EngineIo for RecordingIo {
        fn tool_output(&self, message: &str) {
            self.outputs.lock().unwrap().push(message.to_string());
        }

        fn tool_warning(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }

        fn tool_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }

        fn confirm_ask(&self, question: Question) -> bool {
            self.questions.lock().unwrap().push(question);
            self.answer
        }
    }

    struct Fixture {
        temp: TempDir,
        factory: LlmEngineFactory,
        client: Arc<MockLlmClient>,
    }

    fn fixture(replies: Vec<&str>) -> Fixture {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        fs::write(temp.path().join("main.rs"), "fn main() { old_name(); }\n").unwrap();

        let client = Arc::new(MockLlmClient::new(replies));
        let factory = LlmEngineFactory::new(
            ModelCatalog::default(),
            LlmConfig::default(),
            EngineConfig::default(),
            Workspace::new(temp.path()),
            Handle::current(),
        )
        .with_client(client.clone());

        Fixture { temp, factory, client }
    }

    fn engine(fixture: &Fixture, mode: Mode, io: Arc<RecordingIo>) -> Arc<dyn Engine> {
        let spec = EngineSpec::new(mode, ModelSelection::new("claude-sonnet-4-5"));
        fixture.factory.create(spec, None, io).unwrap()
    }

    async fn run(engine: Arc<dyn Engine>, prompt: &str) -> Vec<Result<String, String>> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut source = engine.run_stream(&prompt);
            let mut chunks = Vec::new();
            while let Some(chunk) = source.next_chunk() {
                chunks.push(chunk.map_err(|e| e.to_string()));
            }
            chunks
        })
        .await
        .unwrap()
    }

    fn text(chunks: &[Result<String, String>]) -> String {
        chunks.iter().filter_map(|c| c.as_ref().ok()).cloned().collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_code_mode_streams_and_applies_edits() {
        let fixture = fixture(vec!["Renamed.\n\nmain.rs\n```rust\nfn main() { new_name(); }\n```\n"]);
        let io = RecordingIo::answering(true);
        let engine = engine(&fixture, Mode::Code, io.clone());

        let chunks = run(engine.clone(), "rename it").await;
        assert!(chunks.len() > 1);
        assert!(text(&chunks).starts_with("Renamed."));

        let content = fs::read_to_string(fixture.temp.path().join("main.rs")).unwrap();
        assert_eq!(content, "fn main() { new_name(); }\n");
        assert_eq!(engine.edited_files(), vec!["main.rs".to_string()]);
        assert!(engine.usage_report().unwrap().starts_with("Tokens: 100 sent, 20 received."));
        assert!(engine.total_cost() > 0.0);
        assert!(engine.reflected_message().is_none());

        let history = engine.history();
        assert!(history.cur.is_empty());
        assert_eq!(history.done[0], ChatMessage::user("rename it"));
        assert_eq!(history.done[1].role, Role::Assistant);
        // Existing file: no creation question
        assert!(io.questions.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_file_requires_confirmation() {
        let fixture = fixture(vec!["new.txt\n```\nhello\n```\n"]);
        let io = RecordingIo::answering(false);
        let engine = engine(&fixture, Mode::Code, io.clone());

        run(engine.clone(), "add a file").await;

        assert!(!fixture.temp.path().join("new.txt").exists());
        assert_eq!(io.questions.lock().unwrap()[0].kind, QuestionKind::CreateFile);
        assert_eq!(io.warnings.lock().unwrap()[0], "Skipping edits to new.txt");
        assert!(engine.edited_files().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ask_mode_never_edits() {
        let fixture = fixture(vec!["main.rs\n```\nclobbered\n```\n"]);
        let engine = engine(&fixture, Mode::Ask, RecordingIo::answering(true));

        run(engine.clone(), "explain").await;

        let content = fs::read_to_string(fixture.temp.path().join("main.rs")).unwrap();
        assert_eq!(content, "fn main() { old_name(); }\n");
        assert!(engine.edited_files().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_edit_requests_reflection() {
        let fixture = fixture(vec!["../escape.txt\n```\nnope\n```\n"]);
        let io = RecordingIo::answering(true);
        let engine = engine(&fixture, Mode::Code, io.clone());

        run(engine.clone(), "write outside").await;

        let reflection = engine.reflected_message().unwrap();
        assert!(reflection.contains("../escape.txt"));
        assert_eq!(io.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_architect_declined_plan_is_not_applied() {
        let fixture = fixture(vec!["Rename old_name to new_name."]);
        let io = RecordingIo::answering(false);
        let engine = engine(&fixture, Mode::Architect, io.clone());

        run(engine.clone(), "plan a rename").await;

        assert_eq!(io.questions.lock().unwrap()[0].kind, QuestionKind::EditFiles);
        assert_eq!(fixture.client.call_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_architect_approved_plan_runs_editor_pass() {
        let fixture = fixture(vec![
            "Rename old_name to new_name.",
            "main.rs\n```\nfn main() { new_name(); }\n```\n",
        ]);
        let io = RecordingIo::answering(true);
        let engine = engine(&fixture, Mode::Architect, io.clone());

        run(engine.clone(), "plan a rename").await;

        assert_eq!(fixture.client.call_count(), 2);
        let content = fs::read_to_string(fixture.temp.path().join("main.rs")).unwrap();
        assert_eq!(content, "fn main() { new_name(); }\n");
        let history = engine.history();
        assert_eq!(history.done.last(), Some(&ChatMessage::assistant(EDITS_APPLIED_ACK)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_files_and_projections() {
        let fixture = fixture(vec![]);
        let io = RecordingIo::answering(true);
        let engine = engine(&fixture, Mode::Code, io.clone());

        let e = engine.clone();
        tokio::task::spawn_blocking(move || {
            e.add_file("main.rs", false).unwrap();
            e.add_file("main.rs", false).unwrap();
            assert!(e.add_file("missing.rs", true).is_err());
        })
        .await
        .unwrap();

        assert_eq!(
            engine.context_files(),
            vec![ContextFile {
                path: "main.rs".to_string(),
                read_only: false
            }]
        );
        assert_eq!(
            io.errors.lock().unwrap()[0],
            "main.rs is already in the chat as an editable file"
        );

        let completion = engine.autocompletion().unwrap();
        assert!(completion.words.contains(&"old_name".to_string()));
        assert!(completion.words.contains(&"main.rs".to_string()));
        assert_eq!(completion.all_files, vec!["main.rs".to_string()]);

        let tokens = engine.tokens_info();
        assert!(tokens.files.contains_key("main.rs"));
        assert!(tokens.system_messages.tokens > 0);

        engine.drop_file("main.rs").unwrap();
        assert!(engine.context_files().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_command_adds_output_when_approved() {
        let fixture = fixture(vec![]);
        let io = RecordingIo::answering(true);
        let engine = engine(&fixture, Mode::Code, io.clone());

        let e = engine.clone();
        tokio::task::spawn_blocking(move || e.run_command("/run echo hello"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(io.outputs.lock().unwrap()[0], "hello");
        assert_eq!(io.questions.lock().unwrap()[0].kind, QuestionKind::AddCommandOutput);
        let history = engine.history();
        assert!(history.done[0].content.contains("And got this output:\n\nhello"));
        assert_eq!(history.done[1], ChatMessage::assistant("Ok."));

        engine.run_command("/bogus").unwrap();
        assert_eq!(io.errors.lock().unwrap()[0], "Invalid command: /bogus");

        engine.run_command("/clear").unwrap();
        assert!(engine.history().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_from_inherits_state() {
        let fixture = fixture(vec![]);
        let io = RecordingIo::answering(true);
        let source = engine(&fixture, Mode::Code, io.clone());
        source.set_total_cost(1.5);
        source.set_commit_hashes(vec!["abc".to_string()]);
        source.push_done_message(ChatMessage::user("earlier"));
        source.set_reasoning_effort(Some("high".to_string()));

        let spec = EngineSpec::new(Mode::Ask, ModelSelection::new("gpt-4o"));
        let derived = fixture.factory.create(spec, Some(&source), io.clone()).unwrap();
        assert_eq!(derived.total_cost(), 1.5);
        assert_eq!(derived.commit_hashes(), vec!["abc".to_string()]);
        assert_eq!(derived.history().done.len(), 1);
        assert_eq!(derived.mode(), Mode::Ask);
        assert_eq!(derived.model().weak_model, "gpt-4o-mini");
        assert_eq!(derived.model().reasoning_effort.as_deref(), Some("high"));

        let spec = EngineSpec::new(Mode::Code, ModelSelection::new("gpt-4o")).with_history(History::default());
        let reset = fixture.factory.create(spec, Some(&source), io).unwrap();
        assert!(reset.history().is_empty());
    }

    #[test]
    fn test_request_turns_merge_roles() {
        let messages = vec![
            ChatMessage::assistant("stray"),
            ChatMessage::user("a"),
            ChatMessage {
                role: Role::System,
                content: "b".to_string(),
            },
            ChatMessage::assistant("c"),
        ];
        let turns = request_turns(&messages);
        assert_eq!(turns, vec![Turn::user("a\n\nb"), Turn::assistant("c")]);
    }

    #[test]
    fn test_token_helpers() {
        assert_eq!(parse_token_budget("8k"), Some(8_000));
        assert_eq!(parse_token_budget("1.5k"), Some(1_500));
        assert_eq!(parse_token_budget("4096"), Some(4_096));
        assert_eq!(parse_token_budget("lots"), None);
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(2_345), "2.3k");
        assert_eq!(format_tokens(45_600), "46k");
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
