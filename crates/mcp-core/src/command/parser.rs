//! Command string parsing and serialization.
//!
//! Grammar: `action:target_type:target_id{json_parameters}` where the trailing
//! JSON object is optional.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use super::types::{Action, BasicInfo, Command, MAX_TARGET_ID_LEN, TargetType};
use crate::error::{Error, Result};

static COMMAND_PATTERN: OnceLock<Regex> = OnceLock::new();

fn command_pattern() -> &'static Regex {
    COMMAND_PATTERN.get_or_init(|| {
        Regex::new(r"^([a-z_]+):([a-z_]+):([a-zA-Z0-9_-]+)(?:\{(.+)\})?$")
            .expect("command pattern is a valid regex")
    })
}

/// Parse a command string into a structured [`Command`].
///
/// Every failure is a validation error whose message names the component that
/// failed.
pub fn parse(input: &str) -> Result<Command> {
    let trimmed = input.trim();

    let caps = command_pattern().captures(trimmed).ok_or_else(|| {
        Error::validation(format!(
            "Invalid command format: '{}'. Expected action:target_type:target_id{{params}}",
            trimmed
        ))
    })?;

    let action_str = &caps[1];
    let action = Action::parse(action_str)
        .ok_or_else(|| Error::validation(format!("Invalid action: {}", action_str)))?;

    let target_str = &caps[2];
    let target_type = TargetType::parse(target_str)
        .ok_or_else(|| Error::validation(format!("Invalid target type: {}", target_str)))?;

    let target_id = &caps[3];
    validate_target_id(target_id)?;

    let parameters = match caps.get(4) {
        Some(body) => parse_parameters(body.as_str())?,
        None => None,
    };

    Ok(Command {
        action,
        target_type,
        target_id: target_id.to_string(),
        parameters,
        agent_id: None,
        session_id: None,
        timestamp: None,
    })
}

/// Check a target id against the grammar and the length cap.
pub fn validate_target_id(target_id: &str) -> Result<()> {
    if target_id.is_empty() {
        return Err(Error::validation("Invalid target id: must not be empty"));
    }
    if target_id.len() > MAX_TARGET_ID_LEN {
        return Err(Error::validation(format!(
            "Invalid target id: must be {} characters or less (got {})",
            MAX_TARGET_ID_LEN,
            target_id.len()
        )));
    }
    if let Some((i, c)) = target_id
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(Error::validation(format!(
            "Invalid target id: character '{}' at position {}",
            c, i
        )));
    }
    Ok(())
}

fn parse_parameters(body: &str) -> Result<Option<Map<String, Value>>> {
    let json = format!("{{{}}}", body);
    match serde_json::from_str::<Value>(&json) {
        Ok(Value::Object(map)) if map.is_empty() => Ok(None),
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(Error::validation("Invalid parameters: expected a JSON object")),
        Err(e) => Err(Error::validation(format!("Invalid JSON parameters: {}", e))),
    }
}

/// Pull `action` and `target_type` out of a command string without validating
/// either. Returns `None` when the string does not even have two `:` separated
/// segments.
pub fn extract_basic_info(input: &str) -> Option<BasicInfo> {
    let mut parts = input.trim().splitn(3, ':');
    let action = parts.next()?.trim();
    let target_type = parts.next()?.trim();
    if action.is_empty() || target_type.is_empty() {
        return None;
    }
    Some(BasicInfo {
        action: action.to_string(),
        target_type: target_type.to_string(),
    })
}

/// Serialize a command back into its string form.
///
/// Only the grammar fields are emitted; agent, session and timestamp are
/// context, not part of the command text.
pub fn serialize(command: &Command) -> String {
    let mut out = format!(
        "{}:{}:{}",
        command.action, command.target_type, command.target_id
    );
    if let Some(params) = command.parameters.as_ref().filter(|p| !p.is_empty()) {
        // A Map always serializes
        out.push_str(&Value::Object(params.clone()).to_string());
    }
    out
}
