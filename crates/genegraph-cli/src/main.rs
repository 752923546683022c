//! genegraph CLI entry point.
//!
//! Binary name: `genegraphd`
//!
//! Parses CLI arguments, loads `genegraph.toml`, sets up tracing, opens the
//! execution store and dispatches to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use genegraph_infra::config::{load_engine_config, CONFIG_FILE_NAME};
use genegraph_infra::sqlite::default_data_dir;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "genegraphd", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));
    let mut config = load_engine_config(&config_path).await;

    if let Err(e) = genegraph_observe::init_tracing(&config.logging, cli.verbosity_filter()) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    if let Some(db) = &cli.db {
        config.database_url = Some(db.clone());
    }
    if let Some(root) = &cli.volume_root {
        config.volume_root = Some(root.display().to_string());
    }

    // Validation needs no database.
    if let Commands::Validate { file } = &cli.command {
        let result = cli::execution::validate(file, cli.json);
        genegraph_observe::shutdown_tracing();
        return result;
    }

    let state = AppState::init(&data_dir, config).await?;
    tracing::debug!(data_dir = %state.data_dir.display(), "genegraphd starting");

    let result = match cli.command {
        Commands::Run { file, name, detach } => {
            cli::execution::run(&state, &file, name, detach, cli.json, cli.quiet).await
        }
        Commands::Status { name } => cli::status::show_status(&state, &name, cli.json).await,
        Commands::List => cli::status::list_executions(&state, cli.json).await,
        Commands::Delete { name } => cli::execution::delete(&state, &name, cli.json).await,
        Commands::Resume => cli::execution::resume(&state, cli.json, cli.quiet).await,
        Commands::Validate { .. } | Commands::Completions { .. } => Ok(()),
    };

    state.controller.shutdown();
    genegraph_observe::shutdown_tracing();
    result
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
