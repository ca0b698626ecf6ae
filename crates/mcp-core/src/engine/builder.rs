//! Engine construction.

use std::sync::Arc;
use tracing::debug;

use super::{EngineConfig, McpEngine};
use crate::action_log::{ActionLogSink, ActionLogger, StorageSink};
use crate::cache::MemoryCache;
use crate::clock::{Clock, system_clock};
use crate::config::{McpConfig, StorageConfig};
use crate::error::Result;
use crate::executor::{CommandExecutor, Services};
use crate::notify::NotificationCenter;
use crate::session::SessionManager;
use crate::storage::{MemoryBackend, StorageBackend, TransactionManager};
use crate::sync::StateSyncEngine;
use crate::tools::ToolRegistry;
use crate::validator::CommandValidator;

/// Wires the modules into an [`McpEngine`].
///
/// Anything not supplied is built from the config: storage from
/// [`StorageConfig`], the default tool set, the built-in validator and handlers.
#[derive(Default)]
pub struct EngineBuilder {
    config: McpConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    clock: Option<Arc<dyn Clock>>,
    notifications: Option<Arc<NotificationCenter>>,
    tools: Option<Arc<ToolRegistry>>,
    validator: Option<Arc<CommandValidator>>,
    executor: Option<Arc<CommandExecutor>>,
    log_sink: Option<Arc<dyn ActionLogSink>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: McpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine_config(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Use a backend that also provides transactions.
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: StorageBackend + TransactionManager + 'static,
    {
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let transactions: Arc<dyn TransactionManager> = storage;
        self.backend = Some(backend);
        self.transactions = Some(transactions);
        self
    }

    /// Use a backend without transactions. Rollback then runs unguarded.
    pub fn storage_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self.transactions = None;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifications(mut self, center: Arc<NotificationCenter>) -> Self {
        self.notifications = Some(center);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn validator(mut self, validator: Arc<CommandValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn executor(mut self, executor: Arc<CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Persist flushed log entries somewhere.
    pub fn log_sink(mut self, sink: Arc<dyn ActionLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<McpEngine> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);

        let (backend, transactions, persistent) = match self.backend {
            Some(backend) => (backend, self.transactions, false),
            None => open_storage(&self.config.storage)?,
        };

        // Persistent stores keep the audit trail alongside the records
        let log_sink = match self.log_sink {
            Some(sink) => Some(sink),
            None if persistent => {
                Some(Arc::new(StorageSink::new(backend.clone())) as Arc<dyn ActionLogSink>)
            }
            None => None,
        };

        let mut logger = ActionLogger::with_clock(self.config.action_log.clone(), clock.clone());
        if let Some(sink) = log_sink {
            logger = logger.with_sink(sink);
        }

        let services = Services {
            sync: Arc::new(StateSyncEngine::with_clock(
                backend.clone(),
                self.config.sync.clone(),
                clock.clone(),
            )),
            cache: Arc::new(MemoryCache::with_clock(
                self.config.cache.clone(),
                clock.clone(),
            )),
            sessions: Arc::new(SessionManager::with_clock(
                self.config.sessions.clone(),
                clock.clone(),
            )),
            logger: Arc::new(logger),
            tools: self
                .tools
                .unwrap_or_else(|| Arc::new(ToolRegistry::with_defaults())),
            clock,
        };

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(CommandExecutor::with_defaults(transactions)));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(CommandValidator::new()));

        debug!(storage = %backend.name(), "MCP engine built");

        Ok(McpEngine::from_parts(
            self.config.engine,
            services,
            validator,
            executor,
            self.notifications,
        ))
    }
}

type OpenedStorage = (
    Arc<dyn StorageBackend>,
    Option<Arc<dyn TransactionManager>>,
    bool,
);

fn open_storage(config: &StorageConfig) -> Result<OpenedStorage> {
    match config {
        StorageConfig::Memory => {
            let memory = Arc::new(MemoryBackend::new());
            let backend: Arc<dyn StorageBackend> = memory.clone();
            Ok((backend, Some(memory as Arc<dyn TransactionManager>), false))
        }
        #[cfg(feature = "db")]
        StorageConfig::Sqlite { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let sqlite = Arc::new(crate::storage::SqliteBackend::open_path(path)?);
            let backend: Arc<dyn StorageBackend> = sqlite.clone();
            Ok((backend, Some(sqlite as Arc<dyn TransactionManager>), true))
        }
        #[cfg(not(feature = "db"))]
        StorageConfig::Sqlite { path } => Err(crate::error::Error::Config(format!(
            "SQLite storage at {} requires the `db` feature",
            path.display()
        ))),
    }
}
