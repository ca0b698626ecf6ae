//! Built-in command handlers.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CommandHandler, ExecutionContext, Services};
use crate::action_log::ActionLogEntry;
use crate::command::{Action, Command, TargetType};
use crate::error::{Error, Result};
use crate::storage::Repository;

fn not_found(command: &Command) -> Error {
    Error::not_found(command.target_type.as_str(), &command.target_id)
}

fn params(command: &Command) -> Map<String, Value> {
    command.parameters.clone().unwrap_or_default()
}

async fn invalidate(ctx: &ExecutionContext, command: &Command) {
    let key = Services::cache_key(command.target_type, &command.target_id);
    ctx.services.cache.delete(&key).await;
}

/// Update a record and drop its cached copy.
async fn patch(ctx: &ExecutionContext, command: &Command, patch: Value) -> Result<Value> {
    let repo = ctx.services.repository(command.target_type);
    let current = repo.update(&command.target_id, patch).await?;
    invalidate(ctx, command).await;
    Ok(current)
}

/// Create, read, update and delete on the target's table.
///
/// Reads go through the cache; writes invalidate it. `update` returns both the
/// previous and current record and `delete` returns what it removed, so the
/// action log holds enough to reverse either.
pub struct CrudHandler;

impl CrudHandler {
    async fn create(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let mut data = params(command);
        data.insert("id".into(), Value::String(command.target_id.clone()));

        let created = ctx
            .services
            .repository(command.target_type)
            .create(&Value::Object(data))
            .await?;
        invalidate(ctx, command).await;
        Ok(created)
    }

    async fn read(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let key = Services::cache_key(command.target_type, &command.target_id);
        if let Some(hit) = ctx.services.cache.get(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let record = ctx
            .services
            .repository(command.target_type)
            .find(&command.target_id)
            .await?
            .ok_or_else(|| not_found(command))?;
        ctx.services.cache.set(key, record.clone(), None).await;
        Ok(record)
    }

    async fn update(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let repo = ctx.services.repository(command.target_type);
        let previous = match repo.find(&command.target_id).await? {
            Some(previous) => previous,
            // Offline reads find nothing; fall back to whatever was cached
            None if !ctx.services.sync.is_online() => {
                let key = Services::cache_key(command.target_type, &command.target_id);
                ctx.services.cache.get(&key).await.unwrap_or(Value::Null)
            }
            None => return Err(not_found(command)),
        };

        let current = patch(ctx, command, Value::Object(params(command))).await?;
        Ok(json!({ "previous": previous, "current": current }))
    }

    async fn delete(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let removed = ctx
            .services
            .repository(command.target_type)
            .delete(&command.target_id)
            .await?
            .ok_or_else(|| not_found(command))?;
        invalidate(ctx, command).await;
        Ok(removed)
    }
}

#[async_trait]
impl CommandHandler for CrudHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        match command.action {
            Action::Create => self.create(command, ctx).await,
            Action::Read => self.read(command, ctx).await,
            Action::Update => self.update(command, ctx).await,
            Action::Delete => self.delete(command, ctx).await,
            other => Err(Error::execution(format!(
                "CRUD handler cannot run {}",
                other
            ))),
        }
    }
}

/// Set `name` from `parameters.name`; records titled with `title` get it too.
pub struct RenameHandler;

#[async_trait]
impl CommandHandler for RenameHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let name = command
            .param_str("name")
            .ok_or_else(|| Error::validation("rename requires a 'name' parameter"))?;

        let existing = ctx
            .services
            .repository(command.target_type)
            .find(&command.target_id)
            .await?;

        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        if existing.as_ref().is_some_and(|r| r.get("title").is_some()) {
            fields.insert("title".into(), json!(name));
        }
        patch(ctx, command, Value::Object(fields)).await
    }
}

/// Mark an item done (or not) and stamp `completedAt`.
pub struct MarkDoneHandler;

#[async_trait]
impl CommandHandler for MarkDoneHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let done = command.param("done").and_then(Value::as_bool).unwrap_or(true);
        let completed_at = if done {
            json!(ctx.services.clock.now().to_rfc3339())
        } else {
            Value::Null
        };
        patch(ctx, command, json!({ "done": done, "completedAt": completed_at })).await
    }
}

/// Store a list's item order.
pub struct ReorderHandler;

#[async_trait]
impl CommandHandler for ReorderHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let order = command
            .param("order")
            .filter(|o| o.is_array())
            .cloned()
            .ok_or_else(|| Error::validation("reorder requires an 'order' array"))?;
        patch(ctx, command, json!({ "order": order })).await
    }
}

/// Status of the system, a session, or a record.
pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        match command.target_type {
            TargetType::System => Ok(serde_json::to_value(ctx.services.snapshot().await)?),
            TargetType::Session => {
                let session = ctx
                    .services
                    .sessions
                    .get_session(&command.target_id)
                    .await
                    .ok_or_else(|| not_found(command))?;
                Ok(serde_json::to_value(session)?)
            }
            target_type => {
                let record = ctx
                    .services
                    .repository(target_type)
                    .find(&command.target_id)
                    .await?
                    .ok_or_else(|| not_found(command))?;
                Ok(json!({
                    "id": command.target_id,
                    "targetType": target_type,
                    "status": record_status(&record),
                }))
            }
        }
    }
}

fn record_status(record: &Value) -> String {
    if let Some(status) = record.get("status").and_then(Value::as_str) {
        return status.to_string();
    }
    match record.get("done").and_then(Value::as_bool) {
        Some(true) => "done".into(),
        Some(false) => "open".into(),
        None => "active".into(),
    }
}

/// Reverse the newest (or a named) rollback candidate on the target.
pub struct RollbackHandler;

impl RollbackHandler {
    async fn pick(&self, command: &Command, ctx: &ExecutionContext) -> Result<ActionLogEntry> {
        let candidates = ctx
            .services
            .logger
            .get_rollback_candidates(command.target_type.as_str(), &command.target_id)
            .await;

        match command.param("entryId").and_then(Value::as_u64) {
            Some(entry_id) => candidates
                .into_iter()
                .find(|e| e.id == entry_id)
                .ok_or_else(|| {
                    Error::validation(format!(
                        "Action {} is not a rollback candidate for {}:{}",
                        entry_id, command.target_type, command.target_id
                    ))
                }),
            None => candidates.into_iter().next().ok_or_else(|| {
                Error::execution(format!(
                    "Nothing to roll back for {}:{}",
                    command.target_type, command.target_id
                ))
            }),
        }
    }

    async fn reverse(
        &self,
        entry: &ActionLogEntry,
        repo: &Repository<Value>,
        target_id: &str,
    ) -> Result<Value> {
        let recorded = |field: Option<&str>| {
            let result = entry.result.as_ref();
            let state = match field {
                Some(f) => result.and_then(|r| r.get(f)),
                None => result,
            };
            state.filter(|v| v.is_object()).cloned().ok_or_else(|| {
                Error::execution(format!(
                    "Action {} has no recorded state to restore",
                    entry.id
                ))
            })
        };

        match entry.action.as_str() {
            "create" => {
                repo.delete(target_id).await?;
                Ok(Value::Null)
            }
            "update" => {
                let previous = recorded(Some("previous"))?;
                repo.delete(target_id).await?;
                repo.create(&previous).await
            }
            "delete" => {
                let removed = recorded(None)?;
                repo.create(&removed).await
            }
            other => Err(Error::execution(format!("Cannot roll back a {} action", other))),
        }
    }
}

#[async_trait]
impl CommandHandler for RollbackHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let entry = self.pick(command, ctx).await?;
        let repo = ctx.services.repository(command.target_type);
        let restored = self.reverse(&entry, &repo, &command.target_id).await?;
        invalidate(ctx, command).await;

        let rollback_id = Uuid::new_v4().to_string();
        ctx.services
            .logger
            .mark_rolled_back(entry.id, &rollback_id)
            .await?;

        info!(
            entry_id = entry.id,
            reversed = %entry.action,
            target = %format!("{}:{}", command.target_type, command.target_id),
            "Rolled back action"
        );
        Ok(json!({
            "rollbackId": rollback_id,
            "entryId": entry.id,
            "reversedAction": entry.action,
            "restored": restored,
        }))
    }
}

/// Queue an agent/workflow operation in the `operations` table.
pub struct OperationHandler;

#[async_trait]
impl CommandHandler for OperationHandler {
    async fn handle(&self, command: &Command, ctx: &ExecutionContext) -> Result<Value> {
        let operations: Repository<Value> =
            Repository::new("operations", ctx.services.sync.clone());

        let record = json!({
            "id": Uuid::new_v4().to_string(),
            "action": command.action,
            "targetType": command.target_type,
            "targetId": command.target_id,
            "parameters": command.parameters,
            "agentId": command.agent_id,
            "sessionId": command.session_id,
            "status": "queued",
            "requestedAt": ctx.services.clock.now().to_rfc3339(),
        });
        let queued = operations.create(&record).await?;
        debug!(action = %command.action, target_id = %command.target_id, "Operation queued");
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::services;
    use super::*;
    use crate::action_log::ActionRecord;
    use crate::storage::StorageBackend;

    fn ctx() -> (ExecutionContext, std::sync::Arc<crate::storage::MemoryBackend>) {
        let (services, backend, _) = services();
        (ExecutionContext::new(services), backend)
    }

    fn cmd(action: Action, target: TargetType, id: &str, params: Value) -> Command {
        Command::new(action, target, id).with_params(params)
    }

    /// Log a handler result the way the engine does.
    async fn log_result(ctx: &ExecutionContext, command: &Command, result: &Value) {
        ctx.services
            .logger
            .log(ActionRecord {
                command: command.to_string(),
                action: command.action.to_string(),
                target_type: command.target_type.to_string(),
                target_id: command.target_id.clone(),
                agent_id: None,
                session_id: None,
                parameters: command.parameters.clone(),
                result: Some(result.clone()),
                success: true,
                error_message: None,
                execution_time_ms: 1,
                timestamp: ctx.services.clock.now(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_crud_round() {
        let (ctx, backend) = ctx();
        let create = cmd(Action::Create, TargetType::List, "l1", json!({"title": "Groceries"}));
        let created = CrudHandler.handle(&create, &ctx).await.unwrap();
        assert_eq!(created, json!({"id": "l1", "title": "Groceries"}));

        let read = Command::new(Action::Read, TargetType::List, "l1");
        CrudHandler.handle(&read, &ctx).await.unwrap();
        assert!(ctx.services.cache.has("lists:l1").await);

        let update = cmd(Action::Update, TargetType::List, "l1", json!({"title": "Shopping"}));
        let changed = CrudHandler.handle(&update, &ctx).await.unwrap();
        assert_eq!(changed["previous"]["title"], "Groceries");
        assert_eq!(changed["current"]["title"], "Shopping");
        assert!(!ctx.services.cache.has("lists:l1").await);

        let delete = Command::new(Action::Delete, TargetType::List, "l1");
        let removed = CrudHandler.handle(&delete, &ctx).await.unwrap();
        assert_eq!(removed["title"], "Shopping");
        assert!(backend.read("lists", "l1").await.unwrap().is_none());

        let err = CrudHandler.handle(&read, &ctx).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_served_from_cache() {
        let (ctx, backend) = ctx();
        backend
            .create("items", json!({"id": "i1", "title": "milk"}))
            .await
            .unwrap();
        let read = Command::new(Action::Read, TargetType::Item, "i1");
        CrudHandler.handle(&read, &ctx).await.unwrap();

        // Changed behind the cache's back
        backend
            .update("items", "i1", json!({"title": "oat milk"}))
            .await
            .unwrap();
        let cached = CrudHandler.handle(&read, &ctx).await.unwrap();
        assert_eq!(cached["title"], "milk");
    }

    #[tokio::test]
    async fn test_rename_mark_done_reorder() {
        let (ctx, backend) = ctx();
        backend
            .create("items", json!({"id": "i1", "title": "milk"}))
            .await
            .unwrap();
        backend.create("lists", json!({"id": "l1"})).await.unwrap();

        let renamed = RenameHandler
            .handle(
                &cmd(Action::Rename, TargetType::Item, "i1", json!({"name": "oat milk"})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(renamed["name"], "oat milk");
        assert_eq!(renamed["title"], "oat milk");

        let done = MarkDoneHandler
            .handle(&Command::new(Action::MarkDone, TargetType::Item, "i1"), &ctx)
            .await
            .unwrap();
        assert_eq!(done["done"], true);
        assert!(done["completedAt"].is_string());

        let undone = MarkDoneHandler
            .handle(
                &cmd(Action::MarkDone, TargetType::Item, "i1", json!({"done": false})),
                &ctx,
            )
            .await
            .unwrap();
        assert!(undone["completedAt"].is_null());

        let reordered = ReorderHandler
            .handle(
                &cmd(Action::Reorder, TargetType::List, "l1", json!({"order": ["i2", "i1"]})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(reordered["order"], json!(["i2", "i1"]));

        let missing = RenameHandler
            .handle(
                &cmd(Action::Rename, TargetType::Item, "nope", json!({"name": "x"})),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_status_targets() {
        let (ctx, backend) = ctx();
        let system = StatusHandler
            .handle(&Command::new(Action::Status, TargetType::System, "core"), &ctx)
            .await
            .unwrap();
        assert_eq!(system["storage"], "memory");
        assert!(system["tools"].as_u64().unwrap() > 0);

        let session = ctx.services.sessions.create_session("a1", None).await.unwrap();
        let found = StatusHandler
            .handle(&Command::new(Action::Status, TargetType::Session, session.id.as_str()), &ctx)
            .await
            .unwrap();
        assert_eq!(found["status"], "active");

        backend
            .create("items", json!({"id": "i1", "done": true}))
            .await
            .unwrap();
        let item = StatusHandler
            .handle(&Command::new(Action::Status, TargetType::Item, "i1"), &ctx)
            .await
            .unwrap();
        assert_eq!(item["status"], "done");
    }

    #[tokio::test]
    async fn test_rollback_update_restores_previous() {
        let (ctx, backend) = ctx();
        let create = cmd(Action::Create, TargetType::Item, "i1", json!({"title": "milk"}));
        let created = CrudHandler.handle(&create, &ctx).await.unwrap();
        log_result(&ctx, &create, &created).await;

        let update = cmd(
            Action::Update,
            TargetType::Item,
            "i1",
            json!({"title": "oat milk", "priority": 2}),
        );
        let changed = CrudHandler.handle(&update, &ctx).await.unwrap();
        log_result(&ctx, &update, &changed).await;

        let rollback = Command::new(Action::Rollback, TargetType::Item, "i1");
        let outcome = RollbackHandler.handle(&rollback, &ctx).await.unwrap();
        assert_eq!(outcome["reversedAction"], "update");

        let record = backend.read("items", "i1").await.unwrap().unwrap();
        assert_eq!(record, json!({"id": "i1", "title": "milk"}));

        let entry = ctx.services.logger.get(2).await.unwrap();
        assert_eq!(
            entry.rollback_id.as_deref(),
            outcome["rollbackId"].as_str()
        );

        // Next candidate is the create
        RollbackHandler.handle(&rollback, &ctx).await.unwrap();
        assert!(backend.read("items", "i1").await.unwrap().is_none());

        let err = RollbackHandler.handle(&rollback, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("Nothing to roll back"));
    }

    #[tokio::test]
    async fn test_rollback_delete_recreates() {
        let (ctx, backend) = ctx();
        backend
            .create("lists", json!({"id": "l1", "title": "Groceries"}))
            .await
            .unwrap();
        let delete = Command::new(Action::Delete, TargetType::List, "l1");
        let removed = CrudHandler.handle(&delete, &ctx).await.unwrap();
        log_result(&ctx, &delete, &removed).await;

        let rollback = cmd(Action::Rollback, TargetType::List, "l1", json!({"entryId": 1}));
        RollbackHandler.handle(&rollback, &ctx).await.unwrap();
        assert_eq!(
            backend.read("lists", "l1").await.unwrap().unwrap()["title"],
            "Groceries"
        );

        let wrong = cmd(Action::Rollback, TargetType::List, "l1", json!({"entryId": 1}));
        let err = RollbackHandler.handle(&wrong, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("not a rollback candidate"));
    }

    #[tokio::test]
    async fn test_operation_queued() {
        let (ctx, backend) = ctx();
        let command = cmd(Action::Train, TargetType::Agent, "a7", json!({"epochs": 3}));
        let queued = OperationHandler.handle(&command, &ctx).await.unwrap();

        assert_eq!(queued["status"], "queued");
        assert_eq!(queued["action"], "train");
        assert_eq!(queued["parameters"]["epochs"], 3);
        assert_eq!(backend.count("operations").await, 1);
    }
}
