// Foreman Goal Engine
// Main entry point for the foreman binary

use clap::Parser;
use foreman_engine::cli::{Cli, Command};
use foreman_engine::config::Config;
use foreman_engine::handlers::{
    handle_aggregate, handle_cancel, handle_cycle, handle_deliverables, handle_doctor,
    handle_history, handle_init, handle_insights, handle_run, handle_status, OutputFormat,
};
use foreman_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // An explicit --log wins and takes effect before config loads, so config
    // errors are visible at the requested level
    if let Some(level) = &cli.log {
        init_telemetry_with_level(level);
    }

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Config-driven log level; a no-op when --log already initialized
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::debug!("Foreman Engine v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Init {
            name,
            mission,
            goals,
            agents,
            budget,
        } => {
            tracing::info!("Creating workspace '{}'", name);
            handle_init(&name, &mission, &goals, &agents, budget, &config, format).await
        }

        Command::Cycle { workspace } => {
            tracing::info!("Running one cycle for '{}'", workspace);
            handle_cycle(&workspace, &config, format).await
        }

        Command::Run => {
            tracing::info!("Starting orchestrator loop");
            handle_run(&config, format).await
        }

        Command::Status { workspace } => handle_status(workspace.as_deref(), &config, format).await,

        Command::Deliverables {
            workspace,
            goal,
            full,
        } => handle_deliverables(&workspace, goal.as_deref(), full, &config, format).await,

        Command::Aggregate { workspace } => {
            tracing::info!("Forcing aggregation for '{}'", workspace);
            handle_aggregate(&workspace, &config, format).await
        }

        Command::Insights { workspace, limit } => {
            handle_insights(&workspace, limit, &config, format).await
        }

        Command::History { workspace, limit } => {
            handle_history(&workspace, limit, &config, format).await
        }

        Command::Cancel { task_id } => {
            tracing::info!("Canceling task {}", task_id);
            handle_cancel(&task_id, &config, format).await
        }

        Command::Doctor => {
            tracing::info!("Running diagnostics");
            handle_doctor(&config, format).await
        }
    }
}
