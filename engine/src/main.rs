// Kommandant orchestration engine
// Main entry point for the kommandant binary

use clap::Parser;
use kommandant_engine::cli::{Cli, Command};
use kommandant_engine::config::Config;
use kommandant_engine::handlers::{
    handle_audit, handle_cancel, handle_checkpoints, handle_history, handle_recover, handle_run,
    handle_specialists, handle_status, OutputFormat,
};
use kommandant_engine::telemetry::{init_telemetry, init_telemetry_with_level, room_span};
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = match &cli.config {
        Some(config_path) => Config::load_or_create_at(config_path),
        None => Config::load_or_create(),
    };

    // Telemetry can only be installed once, so wait for the effective level.
    // RUST_LOG still wins over both --log and the config file.
    let log_level = cli
        .log
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.core.log_level.clone()));
    match log_level {
        Some(level) => init_telemetry_with_level(&level),
        None => init_telemetry(),
    };
    let config = config?;

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Kommandant v{} ({} - {})", version, commit, timestamp);

    let span = room_span(&config.orchestrator);
    dispatch(cli.command, &config, format).instrument(span).await
}

async fn dispatch(command: Command, config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Command::Run {
            prompt,
            task_id,
            context,
            priority,
            strategy,
        } => {
            tracing::info!("Running task: {}", prompt);
            handle_run(prompt, task_id, context, priority, strategy, config, format).await
        }

        Command::Recover { execute } => {
            tracing::info!("Recovering interrupted tasks");
            handle_recover(execute, config, format).await
        }

        Command::Status => handle_status(config, format).await,

        Command::Specialists => handle_specialists(config, format).await,

        Command::History { limit } => {
            tracing::info!("Showing last {} tasks", limit);
            handle_history(limit, config, format).await
        }

        Command::Audit { limit, actor } => handle_audit(limit, actor, config, format).await,

        Command::Checkpoints { task_id, limit } => {
            handle_checkpoints(task_id, limit, config, format).await
        }

        Command::Cancel { task_id } => {
            tracing::info!("Cancelling task: {}", task_id);
            handle_cancel(task_id, config, format).await
        }
    }
}
