//! Interactive read-eval loop.
//!
//! One engine lives for the whole loop, so sessions, cache and the action log
//! carry over between lines. Lines starting with `.` are console commands.

use anyhow::{Context, Result};
use colored::Colorize;
use mcp_core::{McpConfig, TargetType};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{agent_from_args, build_engine, print_response};
use crate::cli::AgentArgs;

const HELP: &str = "\
Commands are action:target_type:target_id{json}, e.g.
  create:list:groceries{\"title\":\"Groceries\"}

Console commands:
  .session             Open a session for the current agent and use it
  .end                 Terminate the current session
  .stats               Engine statistics
  .tools               Tools available to the current agent
  .undo <type> <id>    Show rollback candidates for a target
  .notifications       Recent failure notifications
  .help                This text
  .quit                Exit";

pub async fn execute(args: AgentArgs, config: &McpConfig) -> Result<()> {
    let engine = build_engine(config)?;
    engine.start();

    let agent = agent_from_args(&args);
    let mut session: Option<String> = None;

    eprintln!(
        "{} {} ({})",
        "mcp".cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        agent
            .as_ref()
            .map_or_else(|| "no agent".to_string(), |a| format!("agent {}", a.id))
    );
    eprintln!("Type {} for help", ".help".yellow());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("{} ", "mcp>".cyan());
        std::io::stderr().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        match words.next() {
            Some(".quit") | Some(".exit") => break,
            Some(".help") => eprintln!("{}", HELP),
            Some(".session") => match &agent {
                Some(agent) => match engine.open_session(agent).await {
                    Ok(opened) => {
                        eprintln!("{} session {}", "✓".green(), opened.id);
                        session = Some(opened.id);
                    }
                    Err(e) => eprintln!("{} {}", "✗".red(), e),
                },
                None => eprintln!("{} start the repl with --agent to open sessions", "✗".red()),
            },
            Some(".end") => match session.take() {
                Some(id) => {
                    engine.services().sessions.terminate_session(&id).await;
                    eprintln!("{} session {} terminated", "✓".green(), id);
                }
                None => eprintln!("No active session"),
            },
            Some(".stats") => println!("{}", serde_json::to_string_pretty(&engine.stats().await)?),
            Some(".tools") => {
                let tools = match &agent {
                    Some(agent) => engine.agent_tools(agent).await,
                    None => engine.services().tools.list().await,
                };
                for tool in tools {
                    eprintln!("  {:<18} {}", tool.id.bold(), tool.description.dimmed());
                }
            }
            Some(".undo") => {
                let target_type = words.next().and_then(TargetType::parse);
                match (target_type, words.next()) {
                    (Some(target_type), Some(id)) => {
                        let candidates = engine.rollback_candidates(target_type, id).await;
                        println!("{}", serde_json::to_string_pretty(&candidates)?);
                    }
                    _ => eprintln!("usage: .undo <target_type> <target_id>"),
                }
            }
            Some(".notifications") => {
                if let Some(center) = engine.notifications() {
                    for n in center.list().await {
                        eprintln!("  {} {} {}", n.level.to_string().red(), n.title, n.message.dimmed());
                    }
                }
            }
            Some(other) if other.starts_with('.') => {
                eprintln!("{} unknown console command {}", "✗".red(), other);
            }
            _ => {
                let response = engine
                    .execute(line, agent.as_ref(), session.as_deref())
                    .await;
                print_response(&response)?;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
