//! CLI argument definitions using clap derive macros.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Modular Command Protocol console
///
/// Executes `action:target_type:target_id{json}` commands and prints the
/// response as JSON on stdout.
#[derive(Parser, Debug)]
#[command(name = "mcp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to <data_dir>/config.toml)
    #[arg(long, global = true, env = "MCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use a SQLite database at this path instead of the configured storage
    #[arg(long, global = true, env = "MCP_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one command
    Exec(ExecCommand),

    /// Parse and validate a command without executing it
    Parse {
        /// Command string, e.g. create:list:groceries{"title":"Groceries"}
        command: String,
    },

    /// List registered tools
    Tools {
        /// Only tools usable with these permissions (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        permissions: Option<Vec<String>>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Interactive read-eval loop
    Repl(AgentArgs),

    /// Configuration management
    Config(ConfigCommand),
}

/// Who is issuing commands.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Agent id issuing the command
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Agent permissions, comma separated (all actions when omitted)
    #[arg(short, long, value_delimiter = ',', requires = "agent")]
    pub permissions: Option<Vec<String>>,
}

#[derive(Args, Debug)]
pub struct ExecCommand {
    /// Command string, e.g. read:list:groceries
    pub command: String,

    #[command(flatten)]
    pub agent: AgentArgs,

    /// Session id to run under
    #[arg(short, long)]
    pub session: Option<String>,

    /// Print progress events as they happen
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output as JSON instead of TOML
        #[arg(short, long)]
        json: bool,
    },

    /// Print the config file path
    Path,

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
