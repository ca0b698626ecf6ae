//! The command engine.
//!
//! Drives every command through
//! `Received → Parsed → Validated → PermissionChecked → Executing → Completed | Failed`
//! and turns the outcome into a uniform [`McpResponse`].
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_core::{Agent, McpEngine};
//!
//! async fn example() -> mcp_core::Result<()> {
//!     let engine = McpEngine::builder().build()?;
//!     let agent = Agent::new("agent-1", "Planner").with_permissions(["create", "read"]);
//!
//!     let response = engine
//!         .execute(r#"create:list:groceries{"title":"Groceries"}"#, Some(&agent), None)
//!         .await;
//!     assert!(response.success);
//!     Ok(())
//! }
//! ```

mod builder;
mod types;

pub use builder::EngineBuilder;
pub use types::*;

use chrono::SecondsFormat;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::action_log::{ActionLogEntry, ActionRecord};
use crate::command::{self, Agent, Command, TargetType};
use crate::error::{Error, ErrorCode, McpError, Result};
use crate::executor::{CommandExecutor, ExecutionContext, Services};
use crate::notify::{NotificationCenter, NotificationLevel};
use crate::session::Session;
use crate::tools::Tool;
use crate::validator::CommandValidator;

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// One command on its way through the state machine.
struct Attempt {
    state: CommandState,
    input: Option<CommandInput>,
    /// Raw text, kept for responses and logs when parsing fails
    raw: Option<String>,
    command: Option<Command>,
    agent: Option<Agent>,
    session_id: Option<String>,
    session: Option<Session>,
    result: Option<Value>,
    started: Instant,
}

impl Attempt {
    fn new(input: CommandInput, agent: Option<&Agent>, session_id: Option<&str>) -> Self {
        let raw = match &input {
            CommandInput::Text(text) => Some(text.clone()),
            CommandInput::Structured(_) => None,
        };
        Self {
            state: CommandState::Received,
            input: Some(input),
            raw,
            command: None,
            agent: agent.cloned(),
            session_id: session_id.map(String::from),
            session: None,
            result: None,
            started: Instant::now(),
        }
    }

    fn label(&self) -> String {
        match (&self.command, &self.raw) {
            (Some(cmd), _) => cmd.to_string(),
            (None, Some(raw)) => raw.clone(),
            (None, None) => "unknown".to_string(),
        }
    }

    fn command(&self) -> Result<&Command> {
        self.command
            .as_ref()
            .ok_or_else(|| Error::Other(format!("No command in state {}", self.state)))
    }
}

fn stage_message(state: CommandState) -> &'static str {
    match state {
        CommandState::Received => "Command received",
        CommandState::Parsed => "Command parsed",
        CommandState::Validated => "Command validated",
        CommandState::PermissionChecked => "Permissions checked",
        CommandState::Executing => "Executing command",
        CommandState::Completed => "Command completed",
        CommandState::Failed => "Command failed",
    }
}

/// Orchestrates parsing, validation, authorization, dispatch and logging.
pub struct McpEngine {
    config: EngineConfig,
    services: Services,
    validator: Arc<CommandValidator>,
    executor: Arc<CommandExecutor>,
    notifications: Option<Arc<NotificationCenter>>,
    counters: Counters,
    running: AtomicBool,
}

impl McpEngine {
    /// Start wiring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(
        config: EngineConfig,
        services: Services,
        validator: Arc<CommandValidator>,
        executor: Arc<CommandExecutor>,
        notifications: Option<Arc<NotificationCenter>>,
    ) -> Self {
        Self {
            config,
            services,
            validator,
            executor,
            notifications,
            counters: Counters::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn validator(&self) -> &Arc<CommandValidator> {
        &self.validator
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn notifications(&self) -> Option<&Arc<NotificationCenter>> {
        self.notifications.as_ref()
    }

    /// Run a command to completion.
    ///
    /// Never fails: every error is folded into a response with `success: false`.
    pub async fn execute(
        &self,
        input: impl Into<CommandInput>,
        agent: Option<&Agent>,
        session_id: Option<&str>,
    ) -> McpResponse {
        let mut attempt = Attempt::new(input.into(), agent, session_id);
        let mut failure = None;
        while !attempt.state.is_terminal() {
            if let Err(e) = self.advance(&mut attempt).await {
                failure = Some(e);
                break;
            }
        }
        self.finish(attempt, failure).await
    }

    /// Run a command, yielding a progress event per stage and then exactly one
    /// `Result` or `Error` event.
    pub fn execute_stream<'a>(
        &'a self,
        input: impl Into<CommandInput>,
        agent: Option<&Agent>,
        session_id: Option<&str>,
    ) -> impl Stream<Item = EngineEvent> + Send + 'a {
        let mut attempt = Attempt::new(input.into(), agent, session_id);

        async_stream::stream! {
            yield EngineEvent::Progress {
                stage: CommandState::Received,
                message: stage_message(CommandState::Received).to_string(),
            };

            let mut failure = None;
            while !attempt.state.is_terminal() {
                match self.advance(&mut attempt).await {
                    Ok(()) if attempt.state.is_terminal() => {}
                    Ok(()) => {
                        yield EngineEvent::Progress {
                            stage: attempt.state,
                            message: stage_message(attempt.state).to_string(),
                        };
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            let response = self.finish(attempt, failure).await;
            if response.success {
                yield EngineEvent::Result(response);
            } else {
                yield EngineEvent::Error(response);
            }
        }
    }

    /// Execute several commands in order, stopping at nothing.
    pub async fn execute_batch<I, C>(
        &self,
        inputs: I,
        agent: Option<&Agent>,
        session_id: Option<&str>,
    ) -> Vec<McpResponse>
    where
        I: IntoIterator<Item = C>,
        C: Into<CommandInput>,
    {
        futures::stream::iter(inputs)
            .then(|input| self.execute(input, agent, session_id))
            .collect()
            .await
    }

    /// Move one state forward.
    async fn advance(&self, attempt: &mut Attempt) -> Result<()> {
        let next = match attempt.state {
            CommandState::Received => {
                self.prepare(attempt)?;
                CommandState::Parsed
            }
            CommandState::Parsed => {
                self.validator.validate(attempt.command()?).await?;
                CommandState::Validated
            }
            CommandState::Validated => {
                self.authorize(attempt).await?;
                CommandState::PermissionChecked
            }
            CommandState::PermissionChecked => CommandState::Executing,
            CommandState::Executing => {
                attempt.result = Some(self.dispatch(attempt).await?);
                CommandState::Completed
            }
            CommandState::Completed | CommandState::Failed => return Ok(()),
        };

        debug!(
            command = %attempt.label(),
            from = %attempt.state,
            to = %next,
            "Command state transition"
        );
        attempt.state = next;
        Ok(())
    }

    /// Parse text input and stamp agent, session and time onto the command.
    fn prepare(&self, attempt: &mut Attempt) -> Result<()> {
        let mut command = match attempt.input.take() {
            Some(CommandInput::Text(text)) => command::parse(&text)?,
            Some(CommandInput::Structured(command)) => command,
            None => return Err(Error::Other("Command input already consumed".into())),
        };

        if let Some(agent) = &attempt.agent {
            command.agent_id = Some(agent.id.clone());
        }
        match &attempt.session_id {
            Some(id) => command.session_id = Some(id.clone()),
            None => attempt.session_id = command.session_id.clone(),
        }
        if command.timestamp.is_none() {
            command.timestamp = Some(
                self.services
                    .clock
                    .now()
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }

        attempt.command = Some(command);
        Ok(())
    }

    /// Session check, then the permission gate.
    ///
    /// Session activity is recorded only once the command is authorized.
    async fn authorize(&self, attempt: &mut Attempt) -> Result<()> {
        let action = attempt.command()?.action;

        let mut checked_session = None;
        if self.config.validate_sessions {
            if let Some(session_id) = &attempt.session_id {
                let session = self.services.sessions.check_session(session_id).await?;
                if let (Some(agent), Some(owner)) = (&attempt.agent, &session.agent_id) {
                    if &agent.id != owner {
                        return Err(Error::permission(format!(
                            "Session {} does not belong to agent {}",
                            session_id, agent.id
                        )));
                    }
                }
                checked_session = Some(session_id.clone());
            }
        }

        if self.config.enforce_permissions {
            if let Some(agent) = &attempt.agent {
                if !agent.can(action) {
                    warn!(agent_id = %agent.id, action = %action, "Permission denied");
                    return Err(Error::permission(format!(
                        "Agent {} lacks permission '{}'",
                        agent.id, action
                    )));
                }
            }
        }

        if let Some(session_id) = checked_session {
            let session = self
                .services
                .sessions
                .update_activity(&session_id)
                .await
                .ok_or(Error::InvalidSession(session_id))?;
            attempt.session = Some(session);
        }
        Ok(())
    }

    /// Race the handler against the deadline.
    async fn dispatch(&self, attempt: &Attempt) -> Result<Value> {
        let command = attempt.command()?;
        let ctx = ExecutionContext::new(self.services.clone())
            .with_agent(attempt.agent.clone())
            .with_session(attempt.session.clone());

        match tokio::time::timeout(self.config.timeout(), self.executor.execute(command, &ctx))
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.code() == ErrorCode::UnknownError => {
                Err(Error::execution(e.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::timeout(self.config.timeout_ms)),
        }
    }

    /// Settle the terminal state: log, count, notify and build the response.
    async fn finish(&self, mut attempt: Attempt, failure: Option<Error>) -> McpResponse {
        attempt.state = if failure.is_some() {
            CommandState::Failed
        } else {
            CommandState::Completed
        };
        let execution_time = attempt.started.elapsed().as_millis() as u64;
        let label = attempt.label();
        let agent_id = attempt.agent.as_ref().map(|a| a.id.clone());

        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        match &failure {
            None => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(command = %label, duration_ms = execution_time, "Command completed");
            }
            Some(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = %label,
                    code = %e.code(),
                    error = %e,
                    duration_ms = execution_time,
                    "Command failed"
                );
            }
        }

        if self.config.enable_logging {
            self.services
                .logger
                .log(self.record(&attempt, failure.as_ref(), execution_time))
                .await;
        }

        if let (Some(center), Some(e)) = (&self.notifications, &failure) {
            center
                .publish(
                    NotificationLevel::Error,
                    format!("Command failed: {}", label),
                    e.to_string(),
                )
                .await;
        }

        let metadata = ResponseMetadata {
            execution_time,
            agent: agent_id,
            session_id: attempt.session_id.clone(),
            timestamp: self.services.clock.now(),
        };
        let command = match (attempt.command, attempt.raw) {
            (Some(cmd), _) => ResponseCommand::Structured(cmd),
            (None, raw) => ResponseCommand::Raw(raw.unwrap_or_default()),
        };

        match failure {
            None => McpResponse::ok(command, attempt.result.unwrap_or(Value::Null), metadata),
            Some(e) => McpResponse::failed(command, McpError::from(&e), metadata),
        }
    }

    /// The audit record for a terminal state. Same fields either way.
    fn record(&self, attempt: &Attempt, failure: Option<&Error>, execution_time: u64) -> ActionRecord {
        let (action, target_type, target_id, parameters) = match &attempt.command {
            Some(cmd) => (
                cmd.action.to_string(),
                cmd.target_type.to_string(),
                cmd.target_id.clone(),
                cmd.parameters.clone(),
            ),
            None => {
                let info = attempt.raw.as_deref().and_then(command::extract_basic_info);
                (
                    info.as_ref()
                        .map_or_else(|| "unknown".to_string(), |i| i.action.clone()),
                    info.as_ref()
                        .map_or_else(|| "unknown".to_string(), |i| i.target_type.clone()),
                    "unknown".to_string(),
                    None,
                )
            }
        };

        ActionRecord {
            command: attempt.label(),
            action,
            target_type,
            target_id,
            agent_id: attempt.agent.as_ref().map(|a| a.id.clone()),
            session_id: attempt.session_id.clone(),
            parameters,
            result: attempt.result.clone(),
            success: failure.is_none(),
            error_message: failure.map(|e| e.to_string()),
            execution_time_ms: execution_time,
            timestamp: self.services.clock.now(),
        }
    }

    /// Tools the agent may use.
    pub async fn agent_tools(&self, agent: &Agent) -> Vec<Tool> {
        self.services.tools.get_agent_tools(agent).await
    }

    /// Reversible actions on a target, newest first.
    pub async fn rollback_candidates(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Vec<ActionLogEntry> {
        self.services
            .logger
            .get_rollback_candidates(target_type.as_str(), target_id)
            .await
    }

    /// Open a session for an agent.
    pub async fn open_session(&self, agent: &Agent) -> Result<Session> {
        self.services.sessions.create_session(&agent.id, None).await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            commands_executed: self.counters.executed.load(Ordering::Relaxed),
            commands_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            commands_failed: self.counters.failed.load(Ordering::Relaxed),
            running: self.is_running(),
            system: self.services.snapshot().await,
        }
    }

    /// Start the cache sweep, session sweep, sync interval and log flush.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.services.cache.start_cleanup();
        self.services.sessions.start();
        self.services.sync.start();
        self.services.logger.start();
        info!(storage = %self.services.sync.backend().name(), "MCP engine started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop background work: drain the sync queue, flush the log, end sessions
    /// and clear the cache.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let synced = self.services.sync.shutdown().await;
        let flushed = self.services.logger.shutdown().await;
        let terminated = self.services.sessions.shutdown().await;
        self.services.cache.shutdown().await;

        info!(
            synced = synced.completed,
            sync_failed = synced.failed,
            flushed,
            terminated,
            "MCP engine shut down"
        );
    }
}
