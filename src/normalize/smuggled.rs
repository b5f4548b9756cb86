//! Tool calls smuggled inside a content payload as JSON.
//!
//! Some models answer with `{"tool_calls": [...]}` as plain text instead of
//! using the structured tool-call channel.

use serde_json::Value;

use crate::types::ToolCall;

/// Parse `text` as a JSON object carrying a non-empty `tool_calls` array.
///
/// Entries may be OpenAI-shaped (`{id, function: {name, arguments}}`, with
/// `arguments` either an object or a JSON string) or flat (`{name, arguments}`).
/// Returns `None` when the text is not such an object.
pub fn extract_smuggled_calls(text: &str) -> Option<Vec<ToolCall>> {
    let trimmed = strip_code_fence(text.trim());
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let entries = value.get("tool_calls")?.as_array()?;

    let calls: Vec<ToolCall> = entries.iter().filter_map(parse_entry).collect();
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Whether `text` may still grow into a smuggled tool-call payload.
///
/// True for blank text, a partial code fence, or an opening brace whose JSON
/// is not complete yet. A complete JSON value that is not a tool-call payload
/// is ordinary text.
pub fn may_be_smuggled(text: &str) -> bool {
    let trimmed = text.trim();
    if "```json".starts_with(trimmed) {
        return true;
    }
    let body = strip_code_fence(trimmed);
    body.is_empty() || (body.starts_with('{') && serde_json::from_str::<Value>(body).is_err())
}

fn parse_entry(entry: &Value) -> Option<ToolCall> {
    let function = entry.get("function").unwrap_or(entry);
    let name = function.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = match function.get("arguments").or_else(|| function.get("args")) {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::json!({ "input": raw })),
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(other) => other.clone(),
    };
    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));

    Some(ToolCall::new(id, name, arguments))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
