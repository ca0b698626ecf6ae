//! Command implementations for the mcp CLI.
//!
//! Each submodule implements one subcommand.

pub mod config;
pub mod exec;
pub mod parse;
pub mod repl;
pub mod tools;

use anyhow::{Context, Result};
use colored::Colorize;
use mcp_core::{Agent, McpConfig, McpEngine, McpResponse, NotificationCenter};
use std::sync::Arc;

use crate::cli::AgentArgs;

/// Build an engine from the loaded config.
pub fn build_engine(config: &McpConfig) -> Result<McpEngine> {
    McpEngine::builder()
        .config(config.clone())
        .notifications(Arc::new(NotificationCenter::new()))
        .build()
        .context("Failed to build MCP engine")
}

/// The agent described by `--agent`/`--permissions`, if any.
pub fn agent_from_args(args: &AgentArgs) -> Option<Agent> {
    let id = args.agent.as_ref()?;
    let agent = Agent::new(id.clone(), id.clone());
    Some(match &args.permissions {
        Some(permissions) => agent.with_permissions(permissions.iter().map(|p| p.trim())),
        None => agent.with_all_permissions(),
    })
}

/// Response JSON on stdout, a one-line verdict on stderr.
pub fn print_response(response: &McpResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);

    match &response.error {
        None => eprintln!(
            "{} completed in {}ms",
            "✓".green(),
            response.metadata.execution_time
        ),
        Some(error) => eprintln!(
            "{} {}: {}",
            "✗".red(),
            error.code.to_string().yellow(),
            error.message
        ),
    }
    Ok(())
}
