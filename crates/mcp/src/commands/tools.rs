//! List the tool catalog.

use anyhow::Result;
use colored::Colorize;
use mcp_core::{Agent, McpConfig};

use super::build_engine;

pub async fn execute(permissions: Option<Vec<String>>, json: bool, config: &McpConfig) -> Result<()> {
    let engine = build_engine(config)?;

    let tools = match permissions {
        Some(permissions) => {
            let agent = Agent::new("cli", "cli").with_permissions(permissions);
            engine.agent_tools(&agent).await
        }
        None => engine.services().tools.list().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!("{}", "No tools available".yellow());
        return Ok(());
    }

    println!("{}", "Tools".cyan().bold());
    println!("{}", "─".repeat(60));
    for tool in &tools {
        let state = if tool.enabled {
            "●".green()
        } else {
            "○".dimmed()
        };
        let actions: Vec<&str> = tool.actions.iter().map(|a| a.as_str()).collect();
        println!(
            "{} {:<18} {:<16} {}",
            state,
            tool.id.bold(),
            tool.category.to_string().dimmed(),
            actions.join(", ")
        );
        if !tool.description.is_empty() {
            println!("  {}", tool.description.dimmed());
        }
    }
    Ok(())
}
