//! Business rules that parameter schemas cannot express.

use serde_json::Value;

use crate::command::{Action, Command, TargetType};

/// A cross-field rule checked after schema validation.
pub trait BusinessRule: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this rule has anything to say about the command.
    fn applies_to(&self, command: &Command) -> bool;

    /// `Err` carries a human-readable reason.
    fn check(&self, command: &Command) -> Result<(), String>;
}

/// An item may not declare itself as its own dependency or parent.
pub struct NoSelfDependency;

impl NoSelfDependency {
    const FIELDS: [&'static str; 3] = ["dependencies", "dependsOn", "parentId"];
}

impl BusinessRule for NoSelfDependency {
    fn name(&self) -> &str {
        "no_self_dependency"
    }

    fn applies_to(&self, command: &Command) -> bool {
        command.has_parameters()
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        let references_self = |value: &Value| match value {
            Value::String(s) => s == &command.target_id,
            Value::Array(items) => items
                .iter()
                .any(|v| v.as_str() == Some(command.target_id.as_str())),
            _ => false,
        };

        for field in Self::FIELDS {
            if command.param(field).is_some_and(references_self) {
                return Err(format!(
                    "{} {} cannot depend on itself ({})",
                    command.target_type, command.target_id, field
                ));
            }
        }
        Ok(())
    }
}

/// An update must carry at least one field to change.
pub struct UpdateRequiresChanges;

impl BusinessRule for UpdateRequiresChanges {
    fn name(&self) -> &str {
        "update_requires_changes"
    }

    fn applies_to(&self, command: &Command) -> bool {
        command.action == Action::Update
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        if command.has_parameters() {
            Ok(())
        } else {
            Err("update requires at least one parameter to change".into())
        }
    }
}

/// System targets can be inspected and configured but never created or deleted.
pub struct ProtectedSystemTargets;

impl BusinessRule for ProtectedSystemTargets {
    fn name(&self) -> &str {
        "protected_system_targets"
    }

    fn applies_to(&self, command: &Command) -> bool {
        command.target_type == TargetType::System
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        match command.action {
            Action::Create | Action::Delete => Err(format!(
                "system targets cannot be {}d",
                command.action.as_str()
            )),
            _ => Ok(()),
        }
    }
}

/// `execute` is only meaningful on runnable targets.
pub struct ExecutableTargets;

impl BusinessRule for ExecutableTargets {
    fn name(&self) -> &str {
        "executable_targets"
    }

    fn applies_to(&self, command: &Command) -> bool {
        command.action == Action::Execute
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        match command.target_type {
            TargetType::Workflow | TargetType::Batch | TargetType::Agent | TargetType::System => {
                Ok(())
            }
            other => Err(format!("{} targets cannot be executed", other)),
        }
    }
}

type RuleFn = dyn Fn(&Command) -> Result<(), String> + Send + Sync;

/// A rule built from a closure, scoped to a set of actions.
///
/// This is how handlers extend validation for the actions they own.
pub struct ActionRule {
    name: String,
    actions: Vec<Action>,
    check: Box<RuleFn>,
}

impl ActionRule {
    pub fn new<F>(name: impl Into<String>, actions: &[Action], check: F) -> Self
    where
        F: Fn(&Command) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            actions: actions.to_vec(),
            check: Box::new(check),
        }
    }
}

impl BusinessRule for ActionRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, command: &Command) -> bool {
        self.actions.contains(&command.action)
    }

    fn check(&self, command: &Command) -> Result<(), String> {
        (self.check)(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_self_dependency_detected() {
        let cmd = Command::new(Action::Update, TargetType::Item, "i1")
            .with_params(json!({"dependencies": ["i2", "i1"]}));
        assert!(NoSelfDependency.check(&cmd).is_err());

        let cmd = Command::new(Action::Create, TargetType::Item, "i1")
            .with_params(json!({"parentId": "i1"}));
        assert!(NoSelfDependency.check(&cmd).is_err());

        let cmd = Command::new(Action::Create, TargetType::Item, "i1")
            .with_params(json!({"dependencies": ["i2"]}));
        assert!(NoSelfDependency.check(&cmd).is_ok());
    }

    #[test]
    fn test_update_requires_changes() {
        let cmd = Command::new(Action::Update, TargetType::List, "l1");
        assert!(UpdateRequiresChanges.applies_to(&cmd));
        assert!(UpdateRequiresChanges.check(&cmd).is_err());
    }

    #[test]
    fn test_system_targets_protected() {
        let cmd = Command::new(Action::Delete, TargetType::System, "core");
        assert_eq!(
            ProtectedSystemTargets.check(&cmd).unwrap_err(),
            "system targets cannot be deleted"
        );
        let cmd = Command::new(Action::Status, TargetType::System, "core");
        assert!(ProtectedSystemTargets.check(&cmd).is_ok());
    }

    #[test]
    fn test_executable_targets() {
        let cmd = Command::new(Action::Execute, TargetType::Item, "i1");
        assert!(ExecutableTargets.check(&cmd).is_err());
        let cmd = Command::new(Action::Execute, TargetType::Workflow, "wf");
        assert!(ExecutableTargets.check(&cmd).is_ok());
    }

    #[test]
    fn test_action_rule_closure() {
        let rule = ActionRule::new("no_prod_deploys", &[Action::Deploy], |cmd| {
            if cmd.param_str("env") == Some("prod") {
                Err("prod deploys are frozen".into())
            } else {
                Ok(())
            }
        });

        let cmd = Command::new(Action::Deploy, TargetType::Agent, "a1")
            .with_params(json!({"env": "prod"}));
        assert!(rule.applies_to(&cmd));
        assert!(rule.check(&cmd).is_err());

        let other = Command::new(Action::Read, TargetType::Agent, "a1");
        assert!(!rule.applies_to(&other));
    }
}
