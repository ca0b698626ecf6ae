//! Parse and validate a command without running it.

use anyhow::Result;
use colored::Colorize;
use mcp_core::command;
use mcp_core::validator::CommandValidator;

pub async fn execute(input: &str) -> Result<()> {
    let parsed = match command::parse(input) {
        Ok(parsed) => parsed,
        Err(e) => {
            if let Some(info) = command::extract_basic_info(input) {
                eprintln!(
                    "  action: {}  target: {}",
                    info.action.yellow(),
                    info.target_type.yellow()
                );
            }
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    println!("{}", serde_json::to_string_pretty(&parsed)?);

    match CommandValidator::new().validate(&parsed).await {
        Ok(()) => {
            eprintln!("{} {}", "✓".green(), command::serialize(&parsed));
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            std::process::exit(1);
        }
    }
}
