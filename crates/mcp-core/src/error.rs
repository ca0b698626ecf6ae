//! Error types for mcp-core.
//!
//! Internal failures are carried as [`Error`]. Before anything crosses the engine
//! boundary it is normalized into the wire-level [`McpError`] with one of the four
//! [`ErrorCode`]s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using mcp-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for MCP operations
#[derive(Error, Debug)]
pub enum Error {
    // Command errors
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Permission(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Command timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("No handler registered for {action}:{target_type}")]
    NoHandler { action: String, target_type: String },

    // Session errors
    #[error("Agent {agent_id} already has the maximum of {max} concurrent sessions")]
    SessionLimit { agent_id: String, max: usize },

    #[error("Session invalid or expired: {0}")]
    InvalidSession(String),

    // Lookup errors
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Record already exists in {table}: {id}")]
    Conflict { table: String, id: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage unavailable while offline")]
    Offline,

    #[cfg(feature = "db")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a permission error
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a duplicate-record error
    pub fn conflict(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Conflict {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Map this error onto the wire-level taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Permission(_) | Self::InvalidSession(_) | Self::SessionLimit { .. } => {
                ErrorCode::PermissionError
            }
            Self::Execution(_)
            | Self::Timeout { .. }
            | Self::NoHandler { .. }
            | Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::Storage(_)
            | Self::Offline => ErrorCode::ExecutionError,
            #[cfg(feature = "db")]
            Self::Database(_) => ErrorCode::ExecutionError,
            Self::LockPoisoned
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorCode::UnknownError,
        }
    }

    /// Whether the sync engine may retry an operation that failed with this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Offline | Self::Io(_) | Self::LockPoisoned => true,
            #[cfg(feature = "db")]
            Self::Database(_) => true,
            _ => false,
        }
    }
}

/// Error codes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed command or schema/business-rule violation. Caller-fixable.
    ValidationError,
    /// Agent lacks the permission, or the session is not usable.
    PermissionError,
    /// Handler failed or timed out. Callers may retry.
    ExecutionError,
    /// Anything unexpected.
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl McpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&Error> for McpError {
    fn from(err: &Error) -> Self {
        let code = err.code();
        let mut normalized = McpError::new(code, err.to_string());

        match err {
            Error::Timeout { duration_ms } => {
                normalized.details = Some(serde_json::json!({ "timeoutMs": duration_ms }));
            }
            Error::Conflict { table, id } => {
                normalized.details = Some(serde_json::json!({ "table": table, "id": id }));
            }
            Error::SessionLimit { agent_id, max } => {
                normalized.details =
                    Some(serde_json::json!({ "agentId": agent_id, "maxConcurrentSessions": max }));
            }
            _ if code == ErrorCode::UnknownError => {
                normalized.details = Some(serde_json::json!({ "debug": format!("{:?}", err) }));
            }
            _ => {}
        }

        normalized
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        McpError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("Invalid action: fly");
        assert_eq!(err.to_string(), "Invalid action: fly");
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = Error::not_found("Session", "123");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Session"));
        assert!(err.to_string().contains("123"));

        let err = Error::timeout(5000);
        assert!(err.is_timeout());
        assert!(err.to_string().contains("5000"));
        assert_eq!(err.code(), ErrorCode::ExecutionError);
    }

    #[test]
    fn test_conflict_is_execution_error() {
        let err = Error::conflict("lists", "l1");
        assert_eq!(err.to_string(), "Record already exists in lists: l1");
        assert_eq!(err.code(), ErrorCode::ExecutionError);
        assert!(!err.is_transient());

        let mcp = McpError::from(&err);
        assert_eq!(mcp.details, Some(serde_json::json!({"table": "lists", "id": "l1"})));
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::PermissionError).unwrap();
        assert_eq!(json, "\"PERMISSION_ERROR\"");
        assert_eq!(ErrorCode::UnknownError.to_string(), "UNKNOWN_ERROR");
    }

    #[test]
    fn test_normalization_adds_details() {
        let mcp: McpError = Error::timeout(250).into();
        assert_eq!(mcp.code, ErrorCode::ExecutionError);
        assert_eq!(mcp.details, Some(serde_json::json!({ "timeoutMs": 250 })));

        let mcp: McpError = Error::Other("boom".into()).into();
        assert_eq!(mcp.code, ErrorCode::UnknownError);
        assert!(mcp.details.is_some());

        let mcp: McpError = Error::permission("no").into();
        assert!(mcp.details.is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::storage("connection reset").is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::permission("denied").is_transient());
    }
}
