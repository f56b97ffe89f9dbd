//! Core engine.
//!
//! The [`Engine`] is the entry point for gradebot-core. It loads the
//! deployment configuration, renders the default rubric, and wires the
//! configuration store, session store, extractors, and completion
//! client together. [`start()`](Engine::start) spawns the dispatcher
//! and hands the gateway its [`BotHandle`];
//! [`grade_file()`](Engine::grade_file) drives the grading pipeline
//! directly for one local file (the CLI `check` command).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::completion::{CompletionClient, HttpCompletionClient};
use crate::config::{BotConfig, ConfigStore, EngineSettings, ModelSettings, load_bot_config};
use crate::error::CoreError;
use crate::events::{BotHandle, DocumentUpload};
use crate::extract::ExtractorSet;
use crate::grade::{GradeReport, grade_submission};
use crate::router::{Dispatcher, HandlerCtx};
use crate::session::SessionStore;

/// Buffer size for the gateway-facing channels.
const GATEWAY_CHANNEL_SIZE: usize = 64;

/// Maximum score the built-in rubric grades against.
const RUBRIC_MAX_SCORE: u32 = 100;

/// Core engine wiring configuration, sessions, extraction, and the
/// completion client together.
pub struct Engine {
    bot: BotConfig,
    config: ConfigStore,
    extractors: ExtractorSet,
    client: Arc<dyn CompletionClient>,
}

impl Engine {
    /// Create an engine with the default HTTP completion client.
    ///
    /// Loads `gradebot.yaml` when a path is configured (defaults
    /// otherwise), renders the built-in rubric (plus any overrides from
    /// the prompt directory), and connects the completion client to the
    /// configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::MissingCredentials` if the API key is empty.
    /// Returns `CoreError::Config` if the config file is invalid, or
    /// `CoreError::Prompt` if templates cannot be loaded.
    #[instrument(skip_all)]
    pub fn new(settings: EngineSettings) -> Result<Self, CoreError> {
        if settings.api_key().trim().is_empty() {
            return Err(CoreError::MissingCredentials("completion API key"));
        }

        let bot = match settings.config_path() {
            Some(path) => load_bot_config(path)?,
            None => BotConfig::default(),
        };

        let client = Arc::new(HttpCompletionClient::new(
            settings.api_key(),
            bot.remote.base_url.clone(),
            Duration::from_secs(bot.remote.timeout_secs),
        ));

        Self::with_client(settings, bot, client)
    }

    /// Create an engine with a custom completion client (tests,
    /// alternative transports).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Prompt` if templates cannot be loaded.
    pub fn with_client(
        settings: EngineSettings,
        bot: BotConfig,
        client: Arc<dyn CompletionClient>,
    ) -> Result<Self, CoreError> {
        let mut pm = gradebot_pm::PromptManager::new()?;
        if let Some(dir) = settings.prompt_dir() {
            pm.load_dir(dir)?;
        }
        let rubric = pm.render("grade/rubric", &json!({ "max_score": RUBRIC_MAX_SCORE }))?;

        let active_model = settings
            .model()
            .map(String::from)
            .unwrap_or_else(|| bot.models.initial.clone());

        info!(model = %active_model, endpoint = %bot.remote.base_url, "engine initialized");

        let config = ConfigStore::new(ModelSettings {
            active_model,
            sampling: bot.sampling.clone(),
            rubric,
        });

        Ok(Self {
            bot,
            config,
            extractors: ExtractorSet::with_defaults(),
            client,
        })
    }

    /// Spawn the dispatcher and return the gateway handle.
    ///
    /// Dropping the returned handle shuts the dispatcher down.
    pub fn start(self) -> BotHandle {
        let (event_tx, event_rx) = mpsc::channel(GATEWAY_CHANNEL_SIZE);
        let (reply_tx, reply_rx) = mpsc::channel(GATEWAY_CHANNEL_SIZE);

        let ctx = Arc::new(HandlerCtx {
            config: self.config,
            sessions: SessionStore::new(),
            extractors: self.extractors,
            client: self.client,
            bot: self.bot,
        });

        tokio::spawn(Dispatcher::new(ctx, event_rx, reply_tx).run());

        BotHandle::new(event_tx, reply_rx)
    }

    /// Grade one local file directly, without a gateway: read it, run
    /// the pipeline with the current configuration, return the report.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io` if the file cannot be read, or any
    /// grading-pipeline error.
    #[instrument(skip(self))]
    pub async fn grade_file(&self, path: &Path) -> Result<GradeReport, CoreError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path).await?;

        let snapshot = self.config.snapshot().await;
        let upload = DocumentUpload {
            file_name,
            declared_size: bytes.len() as u64,
            bytes,
        };

        grade_submission(
            &upload,
            &snapshot.rubric,
            &snapshot,
            &self.bot.limits,
            &self.extractors,
            self.client.as_ref(),
        )
        .await
    }

    /// Returns the shared configuration store.
    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    /// Returns the deployment configuration.
    pub fn bot_config(&self) -> &BotConfig {
        &self.bot
    }
}
