//! Three-phase command validation.
//!
//! 1. Structure: target id shape, timestamp format.
//! 2. Schema: parameters against the schema registered for `action:target_type`,
//!    reporting every offending field at once.
//! 3. Business rules: cross-field checks, extensible per action.

mod rules;
mod schema;

pub use rules::*;
pub use schema::*;

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::clock::parse_datetime;
use crate::command::{Command, validate_target_id};
use crate::error::{Error, Result};

/// Validates commands before they reach the executor.
pub struct CommandValidator {
    schemas: Arc<SchemaRegistry>,
    rules: RwLock<Vec<Arc<dyn BusinessRule>>>,
}

impl CommandValidator {
    /// A validator with the built-in schemas and rules.
    pub fn new() -> Self {
        Self::with_schemas(Arc::new(SchemaRegistry::with_defaults()))
    }

    /// A validator over a caller-supplied schema table, with the built-in rules.
    pub fn with_schemas(schemas: Arc<SchemaRegistry>) -> Self {
        let rules: Vec<Arc<dyn BusinessRule>> = vec![
            Arc::new(NoSelfDependency),
            Arc::new(UpdateRequiresChanges),
            Arc::new(ProtectedSystemTargets),
            Arc::new(ExecutableTargets),
        ];
        Self {
            schemas,
            rules: RwLock::new(rules),
        }
    }

    /// The schema table, for registering new action/target pairs.
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Add a business rule.
    pub async fn add_rule(&self, rule: Arc<dyn BusinessRule>) {
        let mut rules = self.rules.write().await;
        rules.push(rule);
    }

    /// Remove a business rule by name.
    pub async fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name() != name);
        rules.len() != before
    }

    /// Run all three phases. Stops at the first phase that reports problems.
    pub async fn validate(&self, command: &Command) -> Result<()> {
        self.validate_structure(command)?;
        self.validate_parameters(command).await?;
        self.validate_business_rules(command).await?;
        debug!(command = %command, "Command validated");
        Ok(())
    }

    /// Phase one.
    pub fn validate_structure(&self, command: &Command) -> Result<()> {
        validate_target_id(&command.target_id)?;

        if let Some(ts) = &command.timestamp {
            if parse_datetime(ts).is_none() {
                return Err(Error::validation(format!(
                    "Invalid timestamp: '{}' is not an ISO-8601 datetime",
                    ts
                )));
            }
        }
        Ok(())
    }

    /// Phase two.
    pub async fn validate_parameters(&self, command: &Command) -> Result<()> {
        let Some(schema) = self
            .schemas
            .get(command.action, command.target_type)
            .await
        else {
            return Ok(());
        };

        let violations = schema.validate(command.parameters.as_ref());
        if violations.is_empty() {
            return Ok(());
        }

        let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
        Err(Error::validation(format!(
            "Parameter validation failed for {}: {}",
            command.key(),
            details.join("; ")
        )))
    }

    /// Phase three.
    pub async fn validate_business_rules(&self, command: &Command) -> Result<()> {
        let rules = self.rules.read().await;
        let failures: Vec<String> = rules
            .iter()
            .filter(|rule| rule.applies_to(command))
            .filter_map(|rule| rule.check(command).err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "Business rule violation: {}",
                failures.join("; ")
            )))
        }
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Action, TargetType, parse};
    use serde_json::json;

    #[tokio::test]
    async fn test_valid_command_passes() {
        let validator = CommandValidator::new();
        let cmd = parse(r#"create:list:abc123{"title":"Groceries"}"#).unwrap();
        validator.validate(&cmd).await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_errors_are_merged() {
        let validator = CommandValidator::new();
        let cmd = parse(r#"create:item:i1{"priority":12,"done":"no"}"#).unwrap();
        let err = validator.validate(&cmd).await.unwrap_err();
        let msg = err.to_string();

        assert!(msg.starts_with("Parameter validation failed for create:item"));
        assert!(msg.contains("title: is required"));
        assert!(msg.contains("priority: must be at most 5"));
        assert!(msg.contains("done: must be a boolean"));
    }

    #[tokio::test]
    async fn test_bad_timestamp_rejected() {
        let validator = CommandValidator::new();
        let mut cmd = Command::new(Action::Read, TargetType::List, "l1");
        cmd.timestamp = Some("yesterday".into());
        let err = validator.validate(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("Invalid timestamp"));

        cmd.timestamp = Some("2024-06-01T12:00:00+02:00".into());
        validator.validate(&cmd).await.unwrap();
    }

    #[tokio::test]
    async fn test_structured_command_with_bad_id() {
        let validator = CommandValidator::new();
        let cmd = Command::new(Action::Read, TargetType::Item, "has space");
        assert!(validator.validate(&cmd).await.is_err());

        let cmd = Command::new(Action::Read, TargetType::Item, "x".repeat(256));
        assert!(validator.validate(&cmd).await.is_err());
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let validator = CommandValidator::new();
        let cmd = Command::new(Action::Update, TargetType::Item, "i7")
            .with_params(json!({"dependencies": ["i7"]}));
        let err = validator.validate(&cmd).await.unwrap_err();
        assert!(err.to_string().contains("cannot depend on itself"));
    }

    #[tokio::test]
    async fn test_custom_rule_and_schema() {
        let validator = CommandValidator::new();
        validator
            .schemas()
            .register(
                Action::Deploy,
                TargetType::Agent,
                ParameterSchema::new().field(FieldSchema::string("env").required()),
            )
            .await;
        validator
            .add_rule(Arc::new(ActionRule::new(
                "no_prod",
                &[Action::Deploy],
                |cmd| match cmd.param_str("env") {
                    Some("prod") => Err("prod is frozen".into()),
                    _ => Ok(()),
                },
            )))
            .await;

        let missing = Command::new(Action::Deploy, TargetType::Agent, "a1");
        assert!(validator.validate(&missing).await.is_err());

        let prod = missing.clone().with_params(json!({"env": "prod"}));
        let err = validator.validate(&prod).await.unwrap_err();
        assert!(err.to_string().contains("prod is frozen"));

        let staging = missing.with_params(json!({"env": "staging"}));
        validator.validate(&staging).await.unwrap();

        assert!(validator.remove_rule("no_prod").await);
        validator.validate(&prod).await.unwrap();
    }
}
