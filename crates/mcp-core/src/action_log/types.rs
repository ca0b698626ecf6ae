//! Action log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_buffer_size() -> usize {
    100
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_retention_days() -> u32 {
    30
}

/// Action logger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogConfig {
    /// Flush once this many entries are buffered
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Entries older than this are purged by `cleanup`
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for ActionLogConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            flush_interval_secs: default_flush_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl ActionLogConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// What the engine knows about a finished command, before it gets an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    /// Serialized command, or the raw input if it never parsed
    pub command: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub result: Option<Value>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// A flushed, append-only log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: u64,
    pub command: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Set when a later action reverses this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ActionLogEntry {
    pub(crate) fn from_record(id: u64, record: ActionRecord) -> Self {
        Self {
            id,
            command: record.command,
            action: record.action,
            target_type: record.target_type,
            target_id: record.target_id,
            agent_id: record.agent_id,
            parameters: record.parameters,
            result: record.result,
            success: record.success,
            error_message: record.error_message,
            execution_time_ms: record.execution_time_ms,
            timestamp: record.timestamp,
            rollback_id: None,
            session_id: record.session_id,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rollback_id.is_some()
    }
}

/// Query filter. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogFilter {
    pub agent_id: Option<String>,
    pub action: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub success: Option<bool>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ActionLogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self.target_id = Some(target_id.into());
        self
    }

    pub fn target_type(mut self, target_type: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, entry: &ActionLogEntry) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }
        fn eq_opt(want: &Option<String>, have: &Option<String>) -> bool {
            want.is_none() || want == have
        }

        eq(&self.action, &entry.action)
            && eq(&self.target_type, &entry.target_type)
            && eq(&self.target_id, &entry.target_id)
            && eq_opt(&self.agent_id, &entry.agent_id)
            && eq_opt(&self.session_id, &entry.session_id)
            && self.success.is_none_or(|s| s == entry.success)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

/// Aggregates over the in-memory log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub average_execution_ms: f64,
    /// Keyed by `action:target_type`
    pub by_action: BTreeMap<String, usize>,
    pub by_agent: BTreeMap<String, usize>,
}
