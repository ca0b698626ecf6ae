//! mcp-core - Modular Command Protocol engine
//!
//! Commands are strings of the form `action:target_type:target_id{json}` issued by
//! agents. This crate turns them into audited, permission-checked operations:
//!
//! - **command**: Grammar, parsing and serialization
//! - **validator**: Structure, schema and business-rule checks
//! - **tools**: Capability bundles and per-agent tool assignment
//! - **cache**: LRU + TTL memory cache
//! - **session**: Time-bounded agent sessions
//! - **action_log**: Buffered, append-only audit trail with rollback candidates
//! - **sync**: Offline-tolerant storage writes with bounded retry
//! - **storage**: Storage backends, transactions and repositories
//! - **executor**: Handler table and built-in handlers
//! - **engine**: The per-command state machine tying it all together
//! - **notify**: Publish/subscribe notifications

pub mod action_log;
mod background;
pub mod cache;
pub mod clock;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod notify;
pub mod session;
pub mod storage;
pub mod sync;
pub mod tools;
pub mod validator;

// Re-export commonly used types
pub use command::{Action, Agent, Command, TargetType};
pub use config::{McpConfig, StorageConfig};
pub use engine::{
    CommandInput, CommandState, EngineBuilder, EngineConfig, EngineEvent, McpEngine,
    McpResponse,
};
pub use error::{Error, ErrorCode, McpError, Result};
pub use executor::{CommandHandler, ExecutionContext, handler_fn};
pub use notify::{Notification, NotificationCenter, NotificationLevel};
