//! Execute a single command.

use anyhow::Result;
use colored::Colorize;
use futures::StreamExt;
use mcp_core::{EngineEvent, McpConfig};

use super::{agent_from_args, build_engine, print_response};
use crate::cli::ExecCommand;

pub async fn execute(cmd: ExecCommand, config: &McpConfig) -> Result<()> {
    let engine = build_engine(config)?;
    let agent = agent_from_args(&cmd.agent);
    let session = cmd.session.as_deref();

    let response = if cmd.stream {
        let mut events = Box::pin(engine.execute_stream(cmd.command.as_str(), agent.as_ref(), session));
        let mut terminal = None;
        while let Some(event) = events.next().await {
            match event {
                EngineEvent::Progress { stage, message } => {
                    eprintln!("{} {} {}", "→".cyan(), stage.to_string().bold(), message.dimmed());
                }
                EngineEvent::Result(response) | EngineEvent::Error(response) => {
                    terminal = Some(response);
                }
            }
        }
        terminal
    } else {
        Some(engine.execute(cmd.command.as_str(), agent.as_ref(), session).await)
    };

    let success = match &response {
        Some(response) => {
            print_response(response)?;
            response.success
        }
        None => false,
    };

    // Drain queued writes and flush the audit log before exiting
    engine.shutdown().await;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
