//! Transaction middleware for command handlers.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::TransactionManager;
use crate::command::Command;
use crate::error::Result;
use crate::executor::{CommandHandler, ExecutionContext};

/// Wrap `handler` so it runs inside a transaction.
pub fn transactional(
    handler: Arc<dyn CommandHandler>,
    manager: Arc<dyn TransactionManager>,
) -> Arc<dyn CommandHandler> {
    Arc::new(Transactional { handler, manager })
}

/// A handler bracketed by begin/commit/rollback.
///
/// If the wrapped future is dropped mid-flight (a timed-out command), the open
/// transaction is rolled back on a spawned task.
pub struct Transactional {
    handler: Arc<dyn CommandHandler>,
    manager: Arc<dyn TransactionManager>,
}

/// Rolls back on drop unless disarmed.
struct RollbackGuard {
    manager: Option<Arc<dyn TransactionManager>>,
}

impl RollbackGuard {
    fn disarm(&mut self) {
        self.manager = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Handler abandoned mid-transaction, rolling back");
                runtime.spawn(async move {
                    if let Err(e) = manager.rollback().await {
                        error!(error = %e, "Rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => error!("Handler abandoned mid-transaction outside a runtime"),
        }
    }
}

#[async_trait]
impl CommandHandler for Transactional {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        self.manager.begin().await?;
        let mut guard = RollbackGuard {
            manager: Some(self.manager.clone()),
        };

        let outcome = self.handler.handle(command, ctx).await;
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.manager.commit().await?;
                debug!(command = %command, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.manager.rollback().await {
                    error!(
                        command = %command,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Action, TargetType};
    use crate::error::Error;
    use crate::executor::handler_fn;
    use crate::storage::{MemoryBackend, StorageBackend};
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> ExecutionContext {
        let (services, _, _) = crate::executor::test_support::services();
        ExecutionContext::new(services)
    }

    fn writer(store: Arc<MemoryBackend>, fail: bool) -> Arc<dyn CommandHandler> {
        handler_fn(move |cmd, _ctx| {
            let store = store.clone();
            async move {
                store.create("lists", json!({"id": cmd.target_id})).await?;
                if fail {
                    return Err(Error::execution("second step failed"));
                }
                Ok(json!({"ok": true}))
            }
        })
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = Arc::new(MemoryBackend::new());
        let handler = transactional(writer(store.clone(), false), store.clone());

        let cmd = Command::new(Action::Create, TargetType::List, "l1");
        handler.handle(&cmd, &ctx()).await.unwrap();

        assert!(store.read("lists", "l1").await.unwrap().is_some());
        assert!(!store.in_transaction().await);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let store = Arc::new(MemoryBackend::new());
        let handler = transactional(writer(store.clone(), true), store.clone());

        let cmd = Command::new(Action::Create, TargetType::List, "l1");
        let err = handler.handle(&cmd, &ctx()).await.unwrap_err();

        assert!(err.to_string().contains("second step failed"));
        assert!(store.read("lists", "l1").await.unwrap().is_none());
        assert!(!store.in_transaction().await);
    }

    #[tokio::test]
    async fn test_dropped_future_rolls_back() {
        let store = Arc::new(MemoryBackend::new());
        let slow = {
            let store = store.clone();
            handler_fn(move |cmd, _ctx| {
                let store = store.clone();
                async move {
                    store.create("lists", json!({"id": cmd.target_id})).await?;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
            })
        };
        let handler = transactional(slow, store.clone());

        let cmd = Command::new(Action::Create, TargetType::List, "l1");
        let ctx = ctx();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), handler.handle(&cmd, &ctx)).await;
        assert!(timed_out.is_err());

        // Let the spawned rollback run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.in_transaction().await);
        assert!(store.read("lists", "l1").await.unwrap().is_none());
    }
}
