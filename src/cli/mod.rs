//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat_loop;
pub mod history;
pub mod model_list;
pub mod say;
pub mod stream_output;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::chat_loop::run_chat;
use crate::cli::history::run_history;
use crate::cli::model_list::list_models;
use crate::cli::say::run_say;
use crate::core::chat::ChatSession;
use crate::core::config::{Config, ConfigKey, ConfigOrchestrator};
use crate::core::http_backend::HttpBackend;
use crate::utils::logging::LoggingState;

pub const LOG_FILTER_ENV: &str = "LOCALCHAT_LOG";

#[derive(Parser)]
#[command(name = "localchat")]
#[command(about = "A streaming chat client for a local LLM server")]
#[command(
    long_about = "localchat talks to a model server running on your machine, streaming \
each answer as it is generated.\n\n\
Environment Variables:\n\
  LOCALCHAT_BASE_URL     Server URL (overrides the config file)\n\
  LOCALCHAT_CONFIG_DIR   Directory holding config.toml\n\
  LOCALCHAT_LOG          Diagnostic log filter, e.g. 'localchat=debug' (falls back to RUST_LOG)\n\n\
Commands inside 'localchat chat':\n\
  /regen /stop /new /switch <id> /history /attach <file> /log /help /quit"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use; defaults to the configured default-model
    #[arg(short = 'm', long, global = true)]
    pub model: Option<String>,

    /// Append finished turns to this transcript file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<String>,

    /// Server URL, e.g. http://127.0.0.1:8000
    #[arg(short = 'u', long, global = true)]
    pub base_url: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start an interactive chat (default)
    Chat,
    /// Send one prompt and print the streamed answer
    Say {
        /// File to attach to the prompt
        #[arg(short = 'a', long)]
        attach: Option<PathBuf>,
        prompt: Vec<String>,
    },
    /// Print the stored history of a session
    History { session_id: String },
    /// List models offered by the server
    Models,
    /// Set a configuration value, or print the configuration when no value is given
    Set {
        key: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset a configuration value
    Unset { key: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn init_tracing() {
    let filter = std::env::var(LOG_FILTER_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let orchestrator = ConfigOrchestrator::from_default_path()?;

    match args.command.as_ref().unwrap_or(&Commands::Chat) {
        Commands::Set { key: None, .. } => {
            orchestrator.load_with_cache()?.print_all();
            Ok(())
        }
        Commands::Set {
            key: Some(key),
            value,
        } => {
            let key: ConfigKey = key.parse()?;
            if value.is_empty() {
                orchestrator.load_with_cache()?.print_all();
                return Ok(());
            }
            let value = value.join(" ");
            orchestrator.mutate(|config| config.set(key, &value))?;
            println!("✅ Set {key} to: {value}");
            Ok(())
        }
        Commands::Unset { key } => {
            let key: ConfigKey = key.parse()?;
            orchestrator.mutate(|config| {
                config.unset(key);
                Ok::<_, String>(())
            })?;
            println!("✅ Unset {key}");
            Ok(())
        }
        Commands::Models => {
            let config = orchestrator.load_with_cache()?;
            let chat = build_chat(&args, &config)?;
            list_models(&chat, config.default_model.as_deref()).await
        }
        Commands::Say { attach, prompt } => {
            let config = orchestrator.load_with_cache()?;
            let chat = build_chat(&args, &config)?;
            let model = pick_model(&chat, &config, args.model.as_deref()).await?;
            run_say(&chat, &model, prompt.clone(), attach.as_deref()).await
        }
        Commands::History { session_id } => {
            let config = orchestrator.load_with_cache()?;
            let chat = build_chat(&args, &config)?;
            let model = pick_model(&chat, &config, args.model.as_deref()).await?;
            run_history(&chat, session_id, &model).await
        }
        Commands::Chat => {
            let config = orchestrator.load_with_cache()?;
            let chat = build_chat(&args, &config)?;
            let model = pick_model(&chat, &config, args.model.as_deref()).await?;
            run_chat(chat, model).await
        }
    }
}

fn build_chat(args: &Args, config: &Config) -> Result<ChatSession, Box<dyn Error>> {
    let base_url = config.resolve_base_url(args.base_url.as_deref());
    let backend = Arc::new(HttpBackend::new(base_url));
    let logging = LoggingState::new(args.log.clone())?;
    Ok(ChatSession::new(
        backend.clone(),
        backend,
        config.turn_timeout(),
        logging,
    ))
}

/// Command line, then config, then the newest model the server reports.
async fn pick_model(
    chat: &ChatSession,
    config: &Config,
    cli_model: Option<&str>,
) -> Result<String, Box<dyn Error>> {
    if let Some(model) = config.resolve_model(cli_model) {
        return Ok(model);
    }
    let models = chat.list_models().await?;
    models.into_iter().next().ok_or_else(|| {
        "No models available. Pass --model or run 'localchat set default-model <name>'.".into()
    })
}
