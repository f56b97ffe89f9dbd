//! Configuration types for gradebot-core.
//!
//! This module defines [`EngineSettings`] (process-level settings from the
//! CLI layer), [`BotConfig`] (deserialized from `gradebot.yaml`), the
//! [`SamplingParams`] knob set, and [`ConfigStore`], the synchronized,
//! process-wide mutable configuration that chat commands edit at runtime.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use typed_builder::TypedBuilder;

use crate::error::CoreError;

// ── Engine Settings (process-level) ──────────────────────────

/// Settings provided by the binary at startup.
///
/// Carries the completion-service credential, the optional config file
/// path, and optional overrides that take precedence over values read
/// from [`BotConfig`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineSettings {
    /// API key for the completion service.
    #[builder(setter(into))]
    api_key: String,

    /// Path to `gradebot.yaml` (defaults are used when absent).
    /// The setter accepts both `PathBuf` and `Option<PathBuf>`.
    #[builder(default, setter(into))]
    config_path: Option<PathBuf>,

    /// Override the initial model (takes precedence over the config file).
    #[builder(default, setter(into))]
    model: Option<String>,

    /// Directory of prompt template overrides (`.j2` / `.jinja`).
    #[builder(default, setter(into))]
    prompt_dir: Option<PathBuf>,
}

impl EngineSettings {
    /// Returns the completion-service API key.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Returns the config file path, if set.
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    /// Returns the model override, if set.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns the prompt override directory, if set.
    pub fn prompt_dir(&self) -> Option<&PathBuf> {
        self.prompt_dir.as_ref()
    }
}

// ── Bot Configuration (gradebot.yaml) ────────────────────────

/// Deployment configuration, deserialized from `gradebot.yaml`.
///
/// All fields have serde defaults so that a missing file or missing keys
/// produce a working configuration (the defaults mirror the original
/// deployment: OpenRouter endpoint, 20 MiB ceiling, 4000-char chunks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Model menu and initial selection.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Initial sampling parameter values.
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Completion endpoint settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Submission limits and output chunking.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session store settings.
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Model menu configuration.
///
/// `menu` is the fixed list shown to users by the choose-model command;
/// `initial` is the model active at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsConfig {
    /// Models offered in the selection menu.
    #[serde(default = "default_model_menu")]
    pub menu: Vec<String>,

    /// Model active at startup.
    #[serde(default = "default_initial_model")]
    pub initial: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            menu: default_model_menu(),
            initial: default_initial_model(),
        }
    }
}

/// Completion endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Base URL of the OpenAI-compatible completion service.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound on a single completion call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Submission and output limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Largest accepted upload, in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Largest single outbound message, in characters.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Sessions idle longer than this are evicted, in seconds.
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_evict_secs: default_idle_evict_secs(),
        }
    }
}

// ── Sampling parameters ──────────────────────────────────────

/// Names of the sampling knobs, in menu display order.
pub const PARAM_NAMES: [&str; 5] = [
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
];

/// The five numeric knobs forwarded to the completion call.
///
/// All values are carried as floats, `max_tokens` included; it is
/// truncated to an integer at the wire boundary. Knobs are addressable
/// by name so the parameter menu and the update handler can treat them
/// uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default)]
    pub frequency_penalty: f64,

    #[serde(default)]
    pub presence_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl SamplingParams {
    /// Set a knob by name.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownParameter` for a name outside
    /// [`PARAM_NAMES`]; the menu never produces one, but callback
    /// payloads come from the transport.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), CoreError> {
        match name {
            "temperature" => self.temperature = value,
            "max_tokens" => self.max_tokens = value,
            "top_p" => self.top_p = value,
            "frequency_penalty" => self.frequency_penalty = value,
            "presence_penalty" => self.presence_penalty = value,
            other => return Err(CoreError::UnknownParameter(other.to_owned())),
        }
        Ok(())
    }

    /// Get a knob by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "temperature" => Some(self.temperature),
            "max_tokens" => Some(self.max_tokens),
            "top_p" => Some(self.top_p),
            "frequency_penalty" => Some(self.frequency_penalty),
            "presence_penalty" => Some(self.presence_penalty),
            _ => None,
        }
    }

    /// All knobs as `(name, value)` pairs in menu order, for display.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        PARAM_NAMES
            .iter()
            .map(|name| {
                // PARAM_NAMES and get() cover the same set of names.
                let value = self.get(name).unwrap_or_default();
                (*name, value)
            })
            .collect()
    }
}

// ── Shared runtime configuration ─────────────────────────────

/// The process-wide configuration record edited by chat commands.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    /// Identifier of the model used for completion calls.
    pub active_model: String,

    /// Current sampling knob values.
    pub sampling: SamplingParams,

    /// Default grading rubric (sessions may carry a personal override).
    pub rubric: String,
}

/// Synchronized handle to the shared [`ModelSettings`].
///
/// All conversations share one store; a write lands in the next
/// [`snapshot()`](ConfigStore::snapshot), so a grading call already
/// holding a snapshot is unaffected. Last writer wins, the accepted
/// race inherited from the original design, now bounded to whole-value
/// commits.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<ModelSettings>>,
}

impl ConfigStore {
    /// Create a store with the given initial settings.
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Atomically copy the current settings.
    pub async fn snapshot(&self) -> ModelSettings {
        self.inner.read().await.clone()
    }

    /// Replace the active model unconditionally.
    ///
    /// Identifiers come from the pre-populated model menu; no further
    /// validation is applied. Takes effect for the next snapshot,
    /// including gradings started by other conversations.
    pub async fn set_active_model(&self, model: impl Into<String>) {
        self.inner.write().await.active_model = model.into();
    }

    /// Parse `raw` as a float and commit it to the named knob.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidNumberFormat` when `raw` does not
    /// parse; the stored value stays untouched so the user can retry.
    /// Returns `CoreError::UnknownParameter` for a name outside the
    /// knob set.
    pub async fn set_parameter(&self, name: &str, raw: &str) -> Result<f64, CoreError> {
        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidNumberFormat(raw.to_owned()))?;

        self.inner.write().await.sampling.set(name, value)?;
        Ok(value)
    }

    /// Current knob values as `(name, value)` pairs, for display.
    pub async fn list_parameters(&self) -> Vec<(&'static str, f64)> {
        self.inner.read().await.sampling.entries()
    }
}

// ── Default value functions for serde ────────────────────────

fn default_model_menu() -> Vec<String> {
    [
        "meta-llama/llama-4-maverick:free",
        "google/gemini-2.5-pro-exp-03-25:free",
        "deepseek/deepseek-chat-v3-0324:free",
        "qwen/qwen3-235b-a22b:free",
    ]
    .map(String::from)
    .to_vec()
}

fn default_initial_model() -> String {
    "qwen/qwen3-235b-a22b:free".to_owned()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_owned()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_chunk_chars() -> usize {
    4000
}

fn default_idle_evict_secs() -> u64 {
    3600
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_tokens() -> f64 {
    4000.0
}

fn default_top_p() -> f64 {
    1.0
}

// ── Config loading ───────────────────────────────────────────

/// Load [`BotConfig`] from a `gradebot.yaml` file.
///
/// If the file does not exist, returns the default configuration.
///
/// # Errors
///
/// Returns `CoreError::Io` if the file exists but cannot be read.
/// Returns `CoreError::Config` if the file contains invalid YAML.
pub fn load_bot_config(config_path: &std::path::Path) -> Result<BotConfig, CoreError> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = std::fs::read_to_string(config_path)?;
    let config: BotConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
