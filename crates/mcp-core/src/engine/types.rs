//! Engine request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::command::Command;
use crate::error::McpError;
use crate::executor::SystemSnapshot;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-command deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Require `action ∈ agent.permissions` when an agent is supplied
    #[serde(default = "default_true")]
    pub enforce_permissions: bool,

    /// Record every terminal state in the action log
    #[serde(default = "default_true")]
    pub enable_logging: bool,

    /// Require a supplied session id to name an active session
    #[serde(default = "default_true")]
    pub validate_sessions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            enforce_permissions: true,
            enable_logging: true,
            validate_sessions: true,
        }
    }
}

impl EngineConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_permission_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_permissions = enforce;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A command as submitted: raw text or already structured.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandInput {
    Text(String),
    Structured(Command),
}

impl From<&str> for CommandInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CommandInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Command> for CommandInput {
    fn from(c: Command) -> Self {
        Self::Structured(c)
    }
}

/// Per-command lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Received,
    Parsed,
    Validated,
    PermissionChecked,
    Executing,
    Completed,
    Failed,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Parsed => "parsed",
            Self::Validated => "validated",
            Self::PermissionChecked => "permission_checked",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The command echoed in a response: structured once parsed, raw otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseCommand {
    Structured(Command),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// Milliseconds from receipt to terminal state
    pub execution_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Uniform response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResponse {
    pub success: bool,
    pub command: ResponseCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
    pub metadata: ResponseMetadata,
}

impl McpResponse {
    pub fn ok(command: ResponseCommand, result: Value, metadata: ResponseMetadata) -> Self {
        Self {
            success: true,
            command,
            result: Some(result),
            error: None,
            metadata,
        }
    }

    pub fn failed(command: ResponseCommand, error: McpError, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            command,
            result: None,
            error: Some(error),
            metadata,
        }
    }

    /// The structured command, if parsing got that far.
    pub fn parsed_command(&self) -> Option<&Command> {
        match &self.command {
            ResponseCommand::Structured(c) => Some(c),
            ResponseCommand::Raw(_) => None,
        }
    }
}

/// Streamed execution progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    Progress { stage: CommandState, message: String },
    Result(McpResponse),
    Error(McpResponse),
}

impl EngineEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Engine-wide counters plus every module's status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub commands_executed: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub running: bool,
    pub system: SystemSnapshot,
}
