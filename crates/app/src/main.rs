mod chat;
mod error;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::ResultExt;
use synapse_core::SessionContext;
use synapse_llm::create_generator;
use synapse_storage::{MemoryLog, MessageLog, ParticipantId, SqliteLog};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{
    AppResult, CreateGeneratorSnafu, OpenLogSnafu, SaveSettingsSnafu, StartSessionSnafu,
};
use crate::settings::SettingsStore;

#[derive(Parser)]
#[command(name = "synapse", about = "Synapse: direct messages and an AI assistant in the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Participant id to sign in as (overrides `user_id` from settings).
    #[arg(long, global = true)]
    user: Option<String>,

    /// Settings file (defaults to <config dir>/synapse/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Keep messages in process memory instead of the sqlite database.
    #[arg(long, global = true, default_value_t = false)]
    memory: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Start an interactive chat session (default when no subcommand is provided).
    Chat,
    /// Write the effective settings to the settings file.
    InitConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // Chat output owns stdout.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_telemetry(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "synapse exited with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::InitConfig => {
            let mut settings = (*store.settings()).clone();
            if let Some(user) = &cli.user {
                settings.user_id = user.clone();
            }
            store.update(settings).context(SaveSettingsSnafu {
                stage: "init-config",
            })?;
            println!("wrote {}", store.config_path().display());
            Ok(())
        }
        Commands::Chat => start_chat(&cli, &store).await,
    }
}

async fn start_chat(cli: &Cli, store: &SettingsStore) -> AppResult<()> {
    let settings = store.settings();
    let identity = cli.user.as_deref().unwrap_or(&settings.user_id).trim();

    let log: Arc<dyn MessageLog> = if cli.memory {
        tracing::info!("using in-memory message log");
        Arc::new(MemoryLog::new())
    } else {
        let log = SqliteLog::open(&settings.database_url)
            .await
            .context(OpenLogSnafu {
                stage: "open-sqlite-log",
                database_url: settings.database_url.clone(),
            })?;
        Arc::new(log)
    };

    if !settings.has_api_key() {
        tracing::warn!("no API key configured; assistant replies will explain how to add one");
    }
    let generator = create_generator(settings.generator_config()).context(CreateGeneratorSnafu {
        stage: "create-generator",
    })?;

    let session = SessionContext::new(
        ParticipantId::new(identity),
        log,
        generator,
        settings.reply_policy(),
    )
    .context(StartSessionSnafu {
        stage: "start-session",
    })?;

    chat::run(session, &settings.assistant_name).await
}
