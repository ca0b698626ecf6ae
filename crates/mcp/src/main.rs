//! mcp - Modular Command Protocol console
//!
//! Parses and executes MCP commands against the configured storage. Responses go
//! to stdout as JSON; logs and status markers go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use mcp_core::{McpConfig, StorageConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mcp=info,mcp_core=info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(McpConfig::config_path);
    let mut config = McpConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(db) = cli.db {
        config.storage = StorageConfig::Sqlite { path: db };
    }
    tracing::debug!(path = %config_path.display(), storage = ?config.storage, "Configuration loaded");

    // Execute command
    match cli.command {
        Commands::Exec(cmd) => commands::exec::execute(cmd, &config).await,
        Commands::Parse { command } => commands::parse::execute(&command).await,
        Commands::Tools { permissions, json } => {
            commands::tools::execute(permissions, json, &config).await
        }
        Commands::Repl(agent) => commands::repl::execute(agent, &config).await,
        Commands::Config(cmd) => commands::config::execute(cmd, &config, &config_path).await,
    }
}
