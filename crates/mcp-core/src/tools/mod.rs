//! Tool Registry
//!
//! Catalog of capabilities an agent could invoke. This is the discovery surface;
//! the engine's per-command permission check is the enforcement surface and does
//! not consult the registry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::command::{Action, Agent};
use crate::error::{Error, Result};

/// Tool category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    ListManagement,
    ItemManagement,
    AgentOperations,
    Workflow,
    System,
    Audit,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListManagement => "list_management",
            Self::ItemManagement => "item_management",
            Self::AgentOperations => "agent_operations",
            Self::Workflow => "workflow",
            Self::System => "system",
            Self::Audit => "audit",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered capability bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub actions: Vec<Action>,
    pub required_permissions: Vec<String>,
    pub category: ToolCategory,
    pub enabled: bool,
}

impl Tool {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            actions: Vec::new(),
            required_permissions: Vec::new(),
            category,
            enabled: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the actions this tool implements. Unless overridden with
    /// [`Tool::requires`], each action is also a required permission.
    pub fn actions(mut self, actions: &[Action]) -> Self {
        self.actions = actions.to_vec();
        if self.required_permissions.is_empty() {
            self.required_permissions = actions.iter().map(|a| a.as_str().to_string()).collect();
        }
        self
    }

    pub fn requires<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `requiredPermissions ⊆ agent.permissions`
    pub fn permitted_for(&self, agent: &Agent) -> bool {
        self.required_permissions
            .iter()
            .all(|p| agent.has_permission(p))
    }
}

/// Tool registry
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Tool>>,
    assignments: RwLock<HashMap<String, HashSet<String>>>, // agent_id -> tool ids
}

impl ToolRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding the built-in catalog
    pub fn with_defaults() -> Self {
        let tools = default_tools()
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        Self {
            tools: RwLock::new(tools),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool
    pub async fn register(&self, tool: Tool) -> Result<()> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&tool.id) {
            return Err(Error::validation(format!(
                "Tool already registered: {}",
                tool.id
            )));
        }
        info!(tool_id = %tool.id, category = %tool.category, "Registered tool");
        tools.insert(tool.id.clone(), tool);
        Ok(())
    }

    /// Unregister a tool, dropping it from every agent assignment
    pub async fn unregister(&self, tool_id: &str) -> Result<Tool> {
        let tool = {
            let mut tools = self.tools.write().await;
            tools
                .remove(tool_id)
                .ok_or_else(|| Error::not_found("Tool", tool_id))?
        };

        let mut assignments = self.assignments.write().await;
        for assigned in assignments.values_mut() {
            assigned.remove(tool_id);
        }

        Ok(tool)
    }

    /// Get tool by ID
    pub async fn get(&self, tool_id: &str) -> Option<Tool> {
        let tools = self.tools.read().await;
        tools.get(tool_id).cloned()
    }

    /// List all tools, sorted by id
    pub async fn list(&self) -> Vec<Tool> {
        let tools = self.tools.read().await;
        let mut list: Vec<Tool> = tools.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// List tools in a category
    pub async fn list_by_category(&self, category: ToolCategory) -> Vec<Tool> {
        self.list()
            .await
            .into_iter()
            .filter(|t| t.category == category)
            .collect()
    }

    /// Enabled tools implementing an action
    pub async fn tools_for_action(&self, action: Action) -> Vec<Tool> {
        self.list()
            .await
            .into_iter()
            .filter(|t| t.enabled && t.actions.contains(&action))
            .collect()
    }

    /// Enable a tool
    pub async fn enable(&self, tool_id: &str) -> Result<()> {
        self.set_enabled(tool_id, true).await
    }

    /// Disable a tool
    pub async fn disable(&self, tool_id: &str) -> Result<()> {
        self.set_enabled(tool_id, false).await
    }

    async fn set_enabled(&self, tool_id: &str, enabled: bool) -> Result<()> {
        let mut tools = self.tools.write().await;
        let tool = tools
            .get_mut(tool_id)
            .ok_or_else(|| Error::not_found("Tool", tool_id))?;
        tool.enabled = enabled;
        debug!(tool_id, enabled, "Tool state changed");
        Ok(())
    }

    /// Restrict an agent's discoverable tools to an explicit allow-list.
    ///
    /// Unknown tool ids are rejected. This narrows discovery only; it grants
    /// nothing the agent's permissions do not already allow.
    pub async fn assign_tools_to_agent<I, S>(&self, agent_id: &str, tool_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: HashSet<String> = tool_ids.into_iter().map(Into::into).collect();
        {
            let tools = self.tools.read().await;
            if let Some(unknown) = ids.iter().find(|id| !tools.contains_key(*id)) {
                return Err(Error::not_found("Tool", unknown.clone()));
            }
        }

        let mut assignments = self.assignments.write().await;
        assignments.insert(agent_id.to_string(), ids);
        Ok(())
    }

    /// Remove an agent's allow-list, restoring permission-based discovery.
    pub async fn clear_agent_assignment(&self, agent_id: &str) -> bool {
        let mut assignments = self.assignments.write().await;
        assignments.remove(agent_id).is_some()
    }

    /// Every enabled tool whose required permissions the agent holds, further
    /// narrowed by the agent's allow-list when one is assigned.
    pub async fn get_agent_tools(&self, agent: &Agent) -> Vec<Tool> {
        let allow_list = {
            let assignments = self.assignments.read().await;
            assignments.get(&agent.id).cloned()
        };

        self.list()
            .await
            .into_iter()
            .filter(|t| t.enabled && t.permitted_for(agent))
            .filter(|t| allow_list.as_ref().is_none_or(|ids| ids.contains(&t.id)))
            .collect()
    }

    /// Whether a specific tool is discoverable by an agent
    pub async fn can_agent_use(&self, agent: &Agent, tool_id: &str) -> bool {
        self.get_agent_tools(agent)
            .await
            .iter()
            .any(|t| t.id == tool_id)
    }

    /// Number of registered tools
    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_tools() -> Vec<Tool> {
    use Action::*;

    vec![
        Tool::new("list_manager", "List Manager", ToolCategory::ListManagement)
            .description("Create, read, update, delete, rename and reorder lists")
            .actions(&[Create, Read, Update, Delete, Rename, Reorder]),
        Tool::new("list_viewer", "List Viewer", ToolCategory::ListManagement)
            .description("Read lists and their status")
            .actions(&[Read, Status]),
        Tool::new("item_manager", "Item Manager", ToolCategory::ItemManagement)
            .description("Create, update, complete and delete items")
            .actions(&[Create, Read, Update, Delete, Rename, MarkDone]),
        Tool::new("agent_trainer", "Agent Trainer", ToolCategory::AgentOperations)
            .description("Plan, train, test and optimize agents")
            .actions(&[Plan, Train, Test, Optimize]),
        Tool::new("agent_deployer", "Agent Deployer", ToolCategory::AgentOperations)
            .description("Deploy and monitor agents")
            .actions(&[Deploy, Monitor]),
        Tool::new("agent_debugger", "Agent Debugger", ToolCategory::AgentOperations)
            .description("Inspect and debug agent behaviour")
            .actions(&[Debug, Log, Status]),
        Tool::new("workflow_runner", "Workflow Runner", ToolCategory::Workflow)
            .description("Execute workflows and batches")
            .actions(&[Execute, Status]),
        Tool::new("system_monitor", "System Monitor", ToolCategory::System)
            .description("Engine-wide status and logging")
            .actions(&[Status, Monitor, Log]),
        Tool::new("rollback", "Rollback", ToolCategory::Audit)
            .description("Reverse previous create, update and delete actions")
            .actions(&[Rollback])
            .requires(["rollback", "read"]),
    ]
}
