//! Message validation.
//!
//! Incoming history may come from the UI or from a model round-trip, so the
//! untyped checks accept any JSON value and look for the required fields
//! themselves instead of trusting a shape.

use serde_json::Value;
use shared::error::MemoryError;
use shared::memory::Message;

const REQUIRED_FIELDS: [&str; 3] = ["id", "role", "content"];

/// Why `value` can't be a message, or `None` if it can
fn invalid_reason(value: &Value) -> Option<String> {
    let Some(object) = value.as_object() else {
        return Some(format!("expected an object, got {}", kind_of(value)));
    };

    for field in REQUIRED_FIELDS {
        match object.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(Value::String(_)) => return Some(format!("`{}` is empty", field)),
            Some(other) => {
                return Some(format!("`{}` must be a string, got {}", field, kind_of(other)))
            }
            None => return Some(format!("missing `{}`", field)),
        }
    }

    match object.get("role").and_then(Value::as_str) {
        Some("user") | Some("assistant") => None,
        Some(other) => Some(format!("unknown role `{}`", other)),
        None => Some("missing `role`".to_string()),
    }
}

/// True iff `value` is an object with non-empty `id` and `content` and a
/// `role` of `user` or `assistant`
pub fn is_valid_message(value: &Value) -> bool {
    invalid_reason(value).is_none()
}

/// Typed counterpart of [`is_valid_message`]. `index` is only used for the error.
pub fn validate_message_at(index: usize, message: &Message) -> Result<(), MemoryError> {
    let reason = if message.id.is_empty() {
        "`id` is empty"
    } else if message.content.is_empty() {
        "`content` is empty"
    } else {
        return Ok(());
    };

    Err(MemoryError::InvalidMessage {
        index,
        reason: reason.to_string(),
    })
}

pub fn validate_message(message: &Message) -> Result<(), MemoryError> {
    validate_message_at(0, message)
}

/// All-or-nothing check of a whole history
pub fn validate_messages(messages: &[Message]) -> Result<(), MemoryError> {
    messages
        .iter()
        .enumerate()
        .try_for_each(|(i, m)| validate_message_at(i, m))
}

/// Convert one untyped message. A role other than user/assistant is rejected.
pub fn parse_message(value: &Value) -> Result<Message, MemoryError> {
    parse_at(0, value)
}

/// Convert an untyped history. Rejects the whole input if it isn't an array
/// or if any element is invalid.
pub fn parse_messages(value: &Value) -> Result<Vec<Message>, MemoryError> {
    let items = value.as_array().ok_or_else(|| MemoryError::NotAnArray {
        found: kind_of(value).to_string(),
    })?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_at(i, item))
        .collect()
}

fn parse_at(index: usize, value: &Value) -> Result<Message, MemoryError> {
    if let Some(reason) = invalid_reason(value) {
        return Err(MemoryError::InvalidMessage { index, reason });
    }

    serde_json::from_value(value.clone()).map_err(|e| MemoryError::InvalidMessage {
        index,
        reason: e.to_string(),
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
