//! Command protocol types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Maximum length of a command target id.
pub const MAX_TARGET_ID_LEN: usize = 255;

// ─────────────────────────────────────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────────────────────────────────────

/// What a command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Execute,
    Reorder,
    Rename,
    Status,
    MarkDone,
    Rollback,
    Plan,
    Train,
    Deploy,
    Test,
    Monitor,
    Optimize,
    Debug,
    Log,
}

impl Action {
    pub const ALL: [Action; 18] = [
        Action::Create,
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::Execute,
        Action::Reorder,
        Action::Rename,
        Action::Status,
        Action::MarkDone,
        Action::Rollback,
        Action::Plan,
        Action::Train,
        Action::Deploy,
        Action::Test,
        Action::Monitor,
        Action::Optimize,
        Action::Debug,
        Action::Log,
    ];

    /// Convert from string
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == s)
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Execute => "execute",
            Self::Reorder => "reorder",
            Self::Rename => "rename",
            Self::Status => "status",
            Self::MarkDone => "mark_done",
            Self::Rollback => "rollback",
            Self::Plan => "plan",
            Self::Train => "train",
            Self::Deploy => "deploy",
            Self::Test => "test",
            Self::Monitor => "monitor",
            Self::Optimize => "optimize",
            Self::Debug => "debug",
            Self::Log => "log",
        }
    }

    /// Actions that change stored state and can therefore be rolled back.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid action: {}", s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TargetType
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of entity a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    List,
    Item,
    Agent,
    System,
    Batch,
    Workflow,
    Session,
}

impl TargetType {
    pub const ALL: [TargetType; 7] = [
        TargetType::List,
        TargetType::Item,
        TargetType::Agent,
        TargetType::System,
        TargetType::Batch,
        TargetType::Workflow,
        TargetType::Session,
    ];

    /// Convert from string
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Item => "item",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Batch => "batch",
            Self::Workflow => "workflow",
            Self::Session => "session",
        }
    }

    /// Storage table backing this target type.
    pub fn table(&self) -> &'static str {
        match self {
            Self::List => "lists",
            Self::Item => "items",
            Self::Agent => "agents",
            Self::System => "systems",
            Self::Batch => "batches",
            Self::Workflow => "workflows",
            Self::Session => "sessions",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid target type: {}", s))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command
// ─────────────────────────────────────────────────────────────────────────────

/// A structured MCP command.
///
/// Produced by the parser (or built directly by a caller) and enriched by the
/// engine with agent, session and timestamp before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub action: Action,
    pub target_type: TargetType,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// ISO-8601 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Command {
    pub fn new(action: Action, target_type: TargetType, target_id: impl Into<String>) -> Self {
        Self {
            action,
            target_type,
            target_id: target_id.into(),
            parameters: None,
            agent_id: None,
            session_id: None,
            timestamp: None,
        }
    }

    /// Attach parameters. An empty map is stored as no parameters.
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = if parameters.is_empty() {
            None
        } else {
            Some(parameters)
        };
        self
    }

    /// Attach parameters from a JSON value; non-object values are ignored.
    pub fn with_params(self, parameters: Value) -> Self {
        match parameters {
            Value::Object(map) => self.with_parameters(map),
            _ => self,
        }
    }

    /// Schema key, `action:target_type`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.action, self.target_type)
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.as_ref().and_then(|p| p.get(name))
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }

    pub fn has_parameters(&self) -> bool {
        self.parameters.as_ref().is_some_and(|p| !p.is_empty())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&super::parser::serialize(self))
    }
}

/// Cheap routing information pulled from a command string without validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicInfo {
    pub action: String,
    pub target_type: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// An identity issuing commands.
///
/// `permissions` holds action names; enforcement is `action ∈ permissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Grant every action.
    pub fn with_all_permissions(self) -> Self {
        self.with_permissions(Action::ALL.iter().map(|a| a.as_str()))
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn can(&self, action: Action) -> bool {
        self.has_permission(action.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_string_conversion() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::MarkDone.as_str(), "mark_done");
        assert!(Action::parse("fly").is_none());
        assert!("fly".parse::<Action>().unwrap_err().contains("fly"));
    }

    #[test]
    fn test_target_type_string_conversion() {
        for target in TargetType::ALL {
            assert_eq!(TargetType::parse(target.as_str()), Some(target));
        }
        assert!(TargetType::parse("folder").is_none());
        assert_eq!(TargetType::Batch.table(), "batches");
    }

    #[test]
    fn test_command_serializes_camel_case() {
        let cmd = Command::new(Action::MarkDone, TargetType::Item, "x1");
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "mark_done");
        assert_eq!(json["targetType"], "item");
        assert_eq!(json["targetId"], "x1");
        assert!(json.get("parameters").is_none());
    }

    #[test]
    fn test_empty_parameters_normalized() {
        let cmd = Command::new(Action::Read, TargetType::List, "a").with_parameters(Map::new());
        assert!(cmd.parameters.is_none());
        assert!(!cmd.has_parameters());
    }

    #[test]
    fn test_agent_permissions() {
        let agent = Agent::new("a1", "Planner").with_permissions(["read", "create"]);
        assert!(agent.can(Action::Read));
        assert!(!agent.can(Action::Delete));

        let admin = Agent::new("root", "Admin").with_all_permissions();
        assert!(Action::ALL.iter().all(|a| admin.can(*a)));
    }
}
