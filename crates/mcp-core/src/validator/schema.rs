//! Parameter schemas keyed by `action:target_type`.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::parse_datetime;
use crate::command::{Action, TargetType};

/// JSON type a parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    /// ISO-8601 timestamp string
    DateTime,
    Any,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::DateTime => "ISO-8601 datetime string",
            Self::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::DateTime => value.as_str().and_then(parse_datetime).is_some(),
            Self::Any => true,
        }
    }
}

/// A single offending field and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Constraints on one parameter.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
    pub one_of: Option<Vec<Value>>,
    pub items: Option<FieldType>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            pattern: None,
            one_of: None,
            items: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Array)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Object)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Minimum string length or array size.
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Maximum string length or array size.
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Regex the string value must match. An invalid pattern is ignored.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Regex::new(pattern).ok();
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.one_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Type every array element must have.
    pub fn items(mut self, item_type: FieldType) -> Self {
        self.items = Some(item_type);
        self
    }

    fn check(&self, value: Option<&Value>, out: &mut Vec<FieldViolation>) {
        let violation = |reason: String| FieldViolation {
            field: self.name.clone(),
            reason,
        };

        let value = match value {
            None | Some(Value::Null) => {
                if self.required {
                    out.push(violation("is required".into()));
                }
                return;
            }
            Some(v) => v,
        };

        if !self.field_type.matches(value) {
            out.push(violation(format!("must be a {}", self.field_type.name())));
            return;
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let (Some(len), Some(min)) = (len, self.min_length) {
            if len < min {
                out.push(violation(format!("must have at least {} characters/elements", min)));
            }
        }
        if let (Some(len), Some(max)) = (len, self.max_length) {
            if len > max {
                out.push(violation(format!("must have at most {} characters/elements", max)));
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| n < *min) {
                out.push(violation(format!("must be at least {}", min)));
            }
            if let Some(max) = self.max.filter(|max| n > *max) {
                out.push(violation(format!("must be at most {}", max)));
            }
        }

        if let (Some(re), Some(s)) = (&self.pattern, value.as_str()) {
            if !re.is_match(s) {
                out.push(violation(format!("must match pattern {}", re.as_str())));
            }
        }

        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                let list: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                out.push(violation(format!("must be one of {}", list.join(", "))));
            }
        }

        if let (Some(item_type), Some(items)) = (self.items, value.as_array()) {
            if let Some(i) = items.iter().position(|item| !item_type.matches(item)) {
                out.push(violation(format!(
                    "element {} must be a {}",
                    i,
                    item_type.name()
                )));
            }
        }
    }
}

/// Schema for the parameters of one `action:target_type` pair.
#[derive(Debug, Clone, Default)]
pub struct ParameterSchema {
    pub fields: Vec<FieldSchema>,
    /// Reject parameters not named in `fields`
    pub strict: bool,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Check parameters, collecting every violation.
    pub fn validate(&self, parameters: Option<&Map<String, Value>>) -> Vec<FieldViolation> {
        let mut violations = Vec::new();

        for field in &self.fields {
            field.check(parameters.and_then(|p| p.get(&field.name)), &mut violations);
        }

        if self.strict {
            if let Some(params) = parameters {
                for key in params.keys() {
                    if !self.fields.iter().any(|f| &f.name == key) {
                        violations.push(FieldViolation {
                            field: key.clone(),
                            reason: "is not a recognized parameter".into(),
                        });
                    }
                }
            }
        }

        violations
    }
}

/// Mutable table of parameter schemas.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<ParameterSchema>>>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in schemas.
    pub fn with_defaults() -> Self {
        let schemas = default_schemas()
            .into_iter()
            .map(|(action, target, schema)| (schema_key(action, target), Arc::new(schema)))
            .collect();
        Self {
            schemas: RwLock::new(schemas),
        }
    }

    /// Register (or replace) the schema for a pair.
    pub async fn register(&self, action: Action, target_type: TargetType, schema: ParameterSchema) {
        let mut schemas = self.schemas.write().await;
        schemas.insert(schema_key(action, target_type), Arc::new(schema));
    }

    pub async fn unregister(&self, action: Action, target_type: TargetType) -> bool {
        let mut schemas = self.schemas.write().await;
        schemas.remove(&schema_key(action, target_type)).is_some()
    }

    pub async fn get(&self, action: Action, target_type: TargetType) -> Option<Arc<ParameterSchema>> {
        let schemas = self.schemas.read().await;
        schemas.get(&schema_key(action, target_type)).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let schemas = self.schemas.read().await;
        let mut keys: Vec<String> = schemas.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn schema_key(action: Action, target_type: TargetType) -> String {
    format!("{}:{}", action, target_type)
}

fn default_schemas() -> Vec<(Action, TargetType, ParameterSchema)> {
    let title = |max: usize| FieldSchema::string("title").min_length(1).max_length(max);
    let description = || FieldSchema::string("description").max_length(2000);
    let priority = || FieldSchema::integer("priority").min(0.0).max(5.0);
    let dependencies = || FieldSchema::array("dependencies").items(FieldType::String);
    let name = || FieldSchema::string("name").required().min_length(1).max_length(200);
    let entry_id = || FieldSchema::integer("entryId").min(1.0);

    vec![
        (
            Action::Create,
            TargetType::List,
            ParameterSchema::new()
                .field(title(200).required())
                .field(description()),
        ),
        (
            Action::Update,
            TargetType::List,
            ParameterSchema::new().field(title(200)).field(description()),
        ),
        (
            Action::Create,
            TargetType::Item,
            ParameterSchema::new()
                .field(title(500).required())
                .field(FieldSchema::string("listId"))
                .field(FieldSchema::boolean("done"))
                .field(priority())
                .field(FieldSchema::datetime("dueDate"))
                .field(dependencies()),
        ),
        (
            Action::Update,
            TargetType::Item,
            ParameterSchema::new()
                .field(title(500))
                .field(FieldSchema::boolean("done"))
                .field(priority())
                .field(FieldSchema::datetime("dueDate"))
                .field(dependencies()),
        ),
        (Action::Rename, TargetType::List, ParameterSchema::new().field(name())),
        (Action::Rename, TargetType::Item, ParameterSchema::new().field(name())),
        (
            Action::Reorder,
            TargetType::List,
            ParameterSchema::new().field(
                FieldSchema::array("order")
                    .required()
                    .items(FieldType::String),
            ),
        ),
        (
            Action::MarkDone,
            TargetType::Item,
            ParameterSchema::new().field(FieldSchema::boolean("done")),
        ),
        (
            Action::Create,
            TargetType::Agent,
            ParameterSchema::new()
                .field(name())
                .field(FieldSchema::array("permissions").items(FieldType::String)),
        ),
        (
            Action::Execute,
            TargetType::Workflow,
            ParameterSchema::new()
                .field(FieldSchema::array("steps").items(FieldType::Object))
                .field(FieldSchema::boolean("dryRun")),
        ),
        (Action::Rollback, TargetType::List, ParameterSchema::new().field(entry_id())),
        (Action::Rollback, TargetType::Item, ParameterSchema::new().field(entry_id())),
        (
            Action::Log,
            TargetType::System,
            ParameterSchema::new()
                .field(FieldSchema::string("message").required().min_length(1))
                .field(FieldSchema::string("level").one_of(["debug", "info", "warn", "error"])),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_collects_every_violation() {
        let schema = ParameterSchema::new()
            .field(FieldSchema::string("title").required())
            .field(FieldSchema::integer("priority").max(5.0))
            .field(FieldSchema::boolean("done"));

        let p = params(json!({"priority": 9, "done": "yes"}));
        let violations = schema.validate(Some(&p));

        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["title", "priority", "done"]);
        assert_eq!(violations[0].reason, "is required");
    }

    #[test]
    fn test_missing_parameters_only_fail_required() {
        let schema = ParameterSchema::new()
            .field(FieldSchema::string("title"))
            .field(FieldSchema::array("order").required());
        let violations = schema.validate(None);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].to_string(), "order: is required");
    }

    #[test]
    fn test_length_pattern_and_enum() {
        let schema = ParameterSchema::new()
            .field(FieldSchema::string("code").min_length(3).pattern("^[A-Z]+$"))
            .field(FieldSchema::string("level").one_of(["info", "warn"]));

        let p = params(json!({"code": "ab", "level": "loud"}));
        let violations = schema.validate(Some(&p));
        assert_eq!(violations.len(), 3);

        let p = params(json!({"code": "ABC", "level": "warn"}));
        assert!(schema.validate(Some(&p)).is_empty());
    }

    #[test]
    fn test_array_items_and_datetime() {
        let schema = ParameterSchema::new()
            .field(FieldSchema::array("order").items(FieldType::String))
            .field(FieldSchema::datetime("dueDate"));

        let p = params(json!({"order": ["a", 2], "dueDate": "tomorrow"}));
        let violations = schema.validate(Some(&p));
        assert_eq!(violations.len(), 2);
        assert!(violations[0].reason.contains("element 1"));

        let p = params(json!({"order": ["a"], "dueDate": "2025-01-01T00:00:00Z"}));
        assert!(schema.validate(Some(&p)).is_empty());
    }

    #[test]
    fn test_strict_rejects_unknown() {
        let schema = ParameterSchema::new()
            .field(FieldSchema::string("name"))
            .strict();
        let p = params(json!({"name": "x", "color": "red"}));
        let violations = schema.validate(Some(&p));
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "color");
    }

    #[tokio::test]
    async fn test_registry_register_and_lookup() {
        let registry = SchemaRegistry::new();
        assert!(registry.get(Action::Train, TargetType::Agent).await.is_none());

        registry
            .register(
                Action::Train,
                TargetType::Agent,
                ParameterSchema::new().field(FieldSchema::string("dataset").required()),
            )
            .await;

        let schema = registry.get(Action::Train, TargetType::Agent).await.unwrap();
        assert_eq!(schema.fields.len(), 1);
        assert_eq!(registry.keys().await, vec!["train:agent".to_string()]);

        assert!(registry.unregister(Action::Train, TargetType::Agent).await);
        assert!(registry.get(Action::Train, TargetType::Agent).await.is_none());
    }

    #[tokio::test]
    async fn test_default_schemas_present() {
        let registry = SchemaRegistry::with_defaults();
        assert!(registry.get(Action::Create, TargetType::List).await.is_some());
        assert!(registry.get(Action::Reorder, TargetType::List).await.is_some());
        assert!(registry.get(Action::Read, TargetType::List).await.is_none());
    }
}
