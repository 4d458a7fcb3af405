//! Model catalog
//!
//! Maps model names to a provider, per-token prices and companion models.
//! The built-in catalog can be extended or overridden from configuration.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    pub name: String,

    /// `anthropic` or `openai`
    pub provider: String,

    #[serde(rename = "input-cost-per-token")]
    pub input_cost_per_token: f64,

    #[serde(rename = "output-cost-per-token")]
    pub output_cost_per_token: f64,

    #[serde(rename = "max-input-tokens")]
    pub max_input_tokens: u64,

    /// Cheap model for summaries and commit messages
    #[serde(rename = "weak-model", skip_serializing_if = "Option::is_none")]
    pub weak_model: Option<String>,

    /// Companion model that applies an architect's plan
    #[serde(rename = "editor-model", skip_serializing_if = "Option::is_none")]
    pub editor_model: Option<String>,

    #[serde(rename = "editor-edit-format", skip_serializing_if = "Option::is_none")]
    pub editor_edit_format: Option<String>,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: "anthropic".to_string(),
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_input_tokens: 128_000,
            weak_model: None,
            editor_model: None,
            editor_edit_format: None,
        }
    }
}

impl ModelEntry {
    fn builtin(name: &str, provider: &str, input: f64, output: f64, max_input_tokens: u64) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            input_cost_per_token: input,
            output_cost_per_token: output,
            max_input_tokens,
            ..Default::default()
        }
    }

    fn with_companions(mut self, weak: &str, editor: &str) -> Self {
        self.weak_model = Some(weak.to_string());
        self.editor_model = Some(editor.to_string());
        self.editor_edit_format = Some("editor-whole".to_string());
        self
    }

    /// Provider metadata forwarded to the peer
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "litellm_provider": self.provider,
            "max_input_tokens": self.max_input_tokens,
            "input_cost_per_token": self.input_cost_per_token,
            "output_cost_per_token": self.output_cost_per_token,
        })
    }
}

/// Known models
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let entries = vec![
            ModelEntry::builtin("claude-sonnet-4-5", "anthropic", 3.0e-6, 15.0e-6, 200_000)
                .with_companions("claude-haiku-4-5", "claude-sonnet-4-5"),
            ModelEntry::builtin("claude-opus-4-1", "anthropic", 15.0e-6, 75.0e-6, 200_000)
                .with_companions("claude-haiku-4-5", "claude-sonnet-4-5"),
            ModelEntry::builtin("claude-haiku-4-5", "anthropic", 1.0e-6, 5.0e-6, 200_000),
            ModelEntry::builtin("gpt-4o", "openai", 2.5e-6, 10.0e-6, 128_000).with_companions("gpt-4o-mini", "gpt-4o"),
            ModelEntry::builtin("gpt-4o-mini", "openai", 0.15e-6, 0.6e-6, 128_000),
            ModelEntry::builtin("o3-mini", "openai", 1.1e-6, 4.4e-6, 200_000).with_companions("gpt-4o-mini", "gpt-4o"),
        ];
        Self { entries }
    }
}

impl ModelCatalog {
    /// Built-in catalog with `extra` entries added, replacing same-named ones
    pub fn with_entries(extra: &[ModelEntry]) -> Self {
        debug!(extra = extra.len(), "ModelCatalog::with_entries: called");
        let mut catalog = Self::default();
        for entry in extra {
            match catalog.entries.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => {
                    debug!(name = %entry.name, "ModelCatalog::with_entries: overriding builtin");
                    *existing = entry.clone();
                }
                None => catalog.entries.push(entry.clone()),
            }
        }
        catalog
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entry for `name`, or a zero-cost entry with an inferred provider
    pub fn resolve(&self, name: &str) -> ModelEntry {
        if let Some(entry) = self.get(name) {
            return entry.clone();
        }
        debug!(%name, "ModelCatalog::resolve: unknown model, inferring provider");
        let (provider, bare) = split_provider(name);
        ModelEntry {
            name: bare.to_string(),
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Environment variables `name` needs that are unset
    pub fn missing_keys(&self, name: &str, llm: &LlmConfig) -> Vec<String> {
        let entry = self.resolve(name);
        match llm.provider(&entry.provider) {
            Some(provider) if provider.api_key().is_err() => vec![provider.api_key_env.clone()],
            _ => Vec::new(),
        }
    }

    /// Sanity warnings for a model the peer selected
    pub fn check_model(&self, name: &str, llm: &LlmConfig) -> Vec<String> {
        debug!(%name, "ModelCatalog::check_model: called");
        let mut warnings = Vec::new();

        if self.get(name).is_none() {
            debug!("ModelCatalog::check_model: unknown model");
            warnings.push(format!(
                "Warning for {}: Unknown context window size and costs, using sane defaults.",
                name
            ));
        }

        let missing = self.missing_keys(name, llm);
        if !missing.is_empty() {
            debug!(?missing, "ModelCatalog::check_model: missing keys");
            warnings.push(format!(
                "Warning: {} expects these environment variables: {}",
                name,
                missing.join(", ")
            ));
        }

        warnings
    }
}

/// Split `provider/model`, or infer the provider from the model name
fn split_provider(name: &str) -> (&str, &str) {
    if let Some((provider, model)) = name.split_once('/')
        && matches!(provider, "anthropic" | "openai")
    {
        return (provider, model);
    }
    if name.starts_with("gpt") || name.starts_with("o1") || name.starts_with("o3") || name.starts_with("o4") {
        ("openai", name)
    } else {
        ("anthropic", name)
    }
}
