//! Configuration management commands.

use anyhow::{Context, Result};
use colored::Colorize;
use mcp_core::McpConfig;
use std::path::Path;

use crate::cli::{ConfigAction, ConfigCommand};

pub async fn execute(cmd: ConfigCommand, config: &McpConfig, path: &Path) -> Result<()> {
    match cmd.action {
        ConfigAction::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(config).context("Failed to serialize config")?
                );
            }
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            McpConfig::default()
                .save_to(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} Wrote {}", "✓".green(), path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(force: bool) -> ConfigCommand {
        ConfigCommand {
            action: ConfigAction::Init { force },
        }
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = McpConfig::default();

        tokio_test::block_on(execute(init(false), &config, &path)).unwrap();
        let written = McpConfig::load_from(&path).unwrap();
        assert_eq!(written, config);

        assert!(tokio_test::block_on(execute(init(false), &config, &path)).is_err());
        tokio_test::block_on(execute(init(true), &config, &path)).unwrap();
    }
}
