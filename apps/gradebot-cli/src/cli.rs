use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gradebot_core::{CoreError, Engine, EngineSettings};
use tracing::info;

use crate::console;

/// Environment variable holding the chat gateway authentication token.
const GATEWAY_TOKEN_VAR: &str = "GRADEBOT_GATEWAY_TOKEN";

/// Environment variable holding the completion-service API key.
const API_KEY_VAR: &str = "GRADEBOT_API_KEY";

#[derive(Debug, Parser)]
#[command(name = "gradebot", about = "AI-powered grading assistant over a chat gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the bot against the interactive console gateway
    Run {
        /// Path to gradebot.yaml (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the initial model
        #[arg(short, long)]
        model: Option<String>,

        /// Directory with prompt template overrides (.j2 / .jinja)
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Directory for JSON log files
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,

        /// Also write JSON logs to the log directory
        #[arg(long)]
        log_file: bool,
    },

    /// Grade a single local file and print the evaluation
    Check {
        /// File to grade (.pdf, .docx, or .txt)
        file: PathBuf,

        /// Path to gradebot.yaml (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the model
        #[arg(short, long)]
        model: Option<String>,
    },
}

impl Cli {
    /// Log directory and whether the JSON file layer is enabled.
    pub fn log_options(&self) -> (PathBuf, bool) {
        match &self.command {
            Commands::Run {
                log_dir, log_file, ..
            } => (log_dir.clone(), *log_file),
            Commands::Check { .. } => (PathBuf::from("logs"), false),
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                model,
                prompts,
                ..
            } => {
                // Both credentials are required before the event loop
                // starts; the console gateway itself does not dial out,
                // but a deployment gateway authenticates with the token.
                let _gateway_token = require_env(GATEWAY_TOKEN_VAR)?;
                let api_key = require_env(API_KEY_VAR)?;

                let engine = Engine::new(build_settings(api_key, config, model, prompts))?;
                let handle = engine.start();
                info!("console gateway started");
                console::run_gateway(handle).await
            }
            Commands::Check {
                file,
                config,
                model,
            } => {
                let api_key = require_env(API_KEY_VAR)?;

                let engine = Engine::new(build_settings(api_key, config, model, None))?;
                info!(file = %file.display(), "grading local file");
                let report = engine.grade_file(&file).await?;

                println!(
                    "File: {} ({} bytes, {} chars) graded by {}",
                    report.file_name, report.byte_size, report.char_count, report.model
                );
                for chunk in &report.chunks {
                    println!("\n{chunk}");
                }
                Ok(())
            }
        }
    }
}

fn build_settings(
    api_key: String,
    config: Option<PathBuf>,
    model: Option<String>,
    prompts: Option<PathBuf>,
) -> EngineSettings {
    EngineSettings::builder()
        .api_key(api_key)
        .config_path(config)
        .model(model)
        .prompt_dir(prompts)
        .build()
}

/// Read a required credential from the environment.
///
/// Refuses to proceed when the variable is absent or blank; this is
/// the only fatal error class; everything later becomes a chat message.
fn require_env(name: &'static str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| CoreError::MissingCredentials(name).into())
}
