//! Command dispatch.
//!
//! Handlers are looked up by exact `(action, target_type)` first, then by the
//! action's wildcard entry. Handlers reach storage, cache, sessions and the
//! audit log through [`Services`].

mod handlers;

pub use handlers::{
    CrudHandler, MarkDoneHandler, OperationHandler, RenameHandler, ReorderHandler,
    RollbackHandler, StatusHandler,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::action_log::{ActionLogger, ActionStats};
use crate::cache::{CacheStats, MemoryCache};
use crate::clock::Clock;
use crate::command::{Action, Agent, Command, TargetType};
use crate::error::{Error, Result};
use crate::session::{Session, SessionManager, SessionStats};
use crate::storage::{Repository, TransactionManager, transactional};
use crate::sync::{StateSyncEngine, SyncState};
use crate::tools::ToolRegistry;

/// Executes one kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value>;
}

/// Handler built from an async closure.
pub struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        (self.handler)(command.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { handler })
}

/// The modules a handler may use.
#[derive(Clone)]
pub struct Services {
    pub sync: Arc<StateSyncEngine>,
    pub cache: Arc<MemoryCache<Value>>,
    pub sessions: Arc<SessionManager>,
    pub logger: Arc<ActionLogger>,
    pub tools: Arc<ToolRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Repository over the table backing a target type.
    pub fn repository(&self, target_type: TargetType) -> Repository<Value> {
        Repository::new(target_type.table(), self.sync.clone())
    }

    /// Cache key for a record.
    pub fn cache_key(target_type: TargetType, id: &str) -> String {
        format!("{}:{}", target_type.table(), id)
    }

    /// Engine-wide status across every module.
    pub async fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            storage: self.sync.backend().name().to_string(),
            cache: self.cache.get_stats().await,
            sessions: self.sessions.stats().await,
            sync: self.sync.status().await,
            tools: self.tools.len().await,
            actions: self.logger.get_action_stats(None).await,
        }
    }
}

/// Point-in-time status of every module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub storage: String,
    pub cache: CacheStats,
    pub sessions: SessionStats,
    pub sync: SyncState,
    pub tools: usize,
    pub actions: ActionStats,
}

/// Per-command context passed to handlers.
#[derive(Clone)]
pub struct ExecutionContext {
    pub services: Services,
    pub agent: Option<Agent>,
    pub session: Option<Session>,
}

impl ExecutionContext {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            agent: None,
            session: None,
        }
    }

    pub fn with_agent(mut self, agent: Option<Agent>) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_session(mut self, session: Option<Session>) -> Self {
        self.session = session;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerKey {
    action: Action,
    /// `None` is the wildcard
    target_type: Option<TargetType>,
}

/// Handler table.
pub struct CommandExecutor {
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn CommandHandler>>>,
}

impl CommandExecutor {
    /// An executor with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// An executor with the built-in handlers.
    ///
    /// When a transaction manager is given, rollback runs inside a transaction.
    pub fn with_defaults(transactions: Option<Arc<dyn TransactionManager>>) -> Self {
        let mut handlers: HashMap<HandlerKey, Arc<dyn CommandHandler>> = HashMap::new();
        let mut wildcard = |action: Action, handler: Arc<dyn CommandHandler>| {
            handlers.insert(
                HandlerKey {
                    action,
                    target_type: None,
                },
                handler,
            );
        };

        let crud: Arc<dyn CommandHandler> = Arc::new(CrudHandler);
        for action in [Action::Create, Action::Read, Action::Update, Action::Delete] {
            wildcard(action, crud.clone());
        }
        wildcard(Action::Status, Arc::new(StatusHandler));

        let rollback: Arc<dyn CommandHandler> = Arc::new(RollbackHandler);
        wildcard(
            Action::Rollback,
            match transactions {
                Some(manager) => transactional(rollback, manager),
                None => rollback,
            },
        );

        let operations: Arc<dyn CommandHandler> = Arc::new(OperationHandler);
        for action in [
            Action::Execute,
            Action::Plan,
            Action::Train,
            Action::Deploy,
            Action::Test,
            Action::Monitor,
            Action::Optimize,
            Action::Debug,
            Action::Log,
        ] {
            wildcard(action, operations.clone());
        }

        let mut exact = |action: Action, target_type: TargetType, handler: Arc<dyn CommandHandler>| {
            handlers.insert(
                HandlerKey {
                    action,
                    target_type: Some(target_type),
                },
                handler,
            );
        };
        exact(Action::Rename, TargetType::List, Arc::new(RenameHandler));
        exact(Action::Rename, TargetType::Item, Arc::new(RenameHandler));
        exact(Action::MarkDone, TargetType::Item, Arc::new(MarkDoneHandler));
        exact(Action::Reorder, TargetType::List, Arc::new(ReorderHandler));

        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register a handler for one action/target pair.
    pub async fn register(
        &self,
        action: Action,
        target_type: TargetType,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.insert(action, Some(target_type), handler).await;
    }

    /// Register a handler for an action on any target.
    pub async fn register_fallback(&self, action: Action, handler: Arc<dyn CommandHandler>) {
        self.insert(action, None, handler).await;
    }

    async fn insert(
        &self,
        action: Action,
        target_type: Option<TargetType>,
        handler: Arc<dyn CommandHandler>,
    ) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(
            HandlerKey {
                action,
                target_type,
            },
            handler,
        );
        debug!(action = %action, target_type = ?target_type, "Registered command handler");
    }

    pub async fn unregister(&self, action: Action, target_type: Option<TargetType>) -> bool {
        let mut handlers = self.handlers.write().await;
        handlers
            .remove(&HandlerKey {
                action,
                target_type,
            })
            .is_some()
    }

    /// Exact match first, then the action's wildcard.
    pub async fn resolve(
        &self,
        action: Action,
        target_type: TargetType,
    ) -> Option<Arc<dyn CommandHandler>> {
        let handlers = self.handlers.read().await;
        handlers
            .get(&HandlerKey {
                action,
                target_type: Some(target_type),
            })
            .or_else(|| {
                handlers.get(&HandlerKey {
                    action,
                    target_type: None,
                })
            })
            .cloned()
    }

    pub async fn has_handler(&self, action: Action, target_type: TargetType) -> bool {
        self.resolve(action, target_type).await.is_some()
    }

    /// Dispatch a command to its handler.
    pub async fn execute(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let handler = self
            .resolve(command.action, command.target_type)
            .await
            .ok_or_else(|| Error::NoHandler {
                action: command.action.to_string(),
                target_type: command.target_type.to_string(),
            })?;
        handler.handle(command, ctx).await
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::with_defaults(None)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::action_log::ActionLogConfig;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::session::SessionConfig;
    use crate::storage::MemoryBackend;
    use crate::sync::SyncConfig;

    pub(crate) fn services() -> (Services, Arc<MemoryBackend>, ManualClock) {
        let clock = ManualClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let backend = Arc::new(MemoryBackend::new());
        let services = Services {
            sync: Arc::new(StateSyncEngine::with_clock(
                backend.clone(),
                SyncConfig::default(),
                shared.clone(),
            )),
            cache: Arc::new(MemoryCache::with_clock(CacheConfig::default(), shared.clone())),
            sessions: Arc::new(SessionManager::with_clock(
                SessionConfig::default(),
                shared.clone(),
            )),
            logger: Arc::new(ActionLogger::with_clock(
                ActionLogConfig::default(),
                shared.clone(),
            )),
            tools: Arc::new(ToolRegistry::with_defaults()),
            clock: shared,
        };
        (services, backend, clock)
    }
}
