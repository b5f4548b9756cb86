//! Line-delimited JSON-RPC 2.0 messages and agent session payloads.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ConfirmationPrompt, PlanEntry, RpcEvent, TextChunk};
use crate::error::{RelayError, Result};
use crate::types::{ConfirmationOption, OptionKind, ToolCallStatus, ToolKind};

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for RelayError {
    fn from(error: RpcError) -> Self {
        RelayError::Protocol(format!("{} (code {})", error.message, error.code))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: std::result::Result<Value, RpcError>,
    },
}

impl RpcMessage {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self::Request {
            id: json!(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self::Notification {
            method: method.to_string(),
            params,
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let id = value.get("id").cloned().filter(|id| !id.is_null());
        let method = value.get("method").and_then(Value::as_str);
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method: method.to_string(),
                params,
            }),
            (None, Some(method)) => Ok(Self::Notification {
                method: method.to_string(),
                params,
            }),
            (Some(id), None) => {
                let result = match value.get("error") {
                    Some(error) => Err(serde_json::from_value(error.clone())?),
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, result })
            }
            (None, None) => Err(RelayError::Protocol(format!(
                "not a JSON-RPC message: {line}"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "method": method,
                "params": params,
            }),
            Self::Notification { method, params } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method,
                "params": params,
            }),
            Self::Response { id, result } => match result {
                Ok(result) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "result": result,
                }),
                Err(error) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "error": error,
                }),
            },
        }
    }

    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }
}

/// Map an agent tool kind onto the canonical one.
pub fn tool_kind(kind: &str) -> Option<ToolKind> {
    match kind {
        "read" | "search" | "fetch" => Some(ToolKind::Read),
        "edit" | "delete" | "move" => Some(ToolKind::Edit),
        "execute" => Some(ToolKind::Execute),
        _ => None,
    }
}

fn status(value: Option<&Value>) -> Option<ToolCallStatus> {
    value?.as_str()?.parse().ok()
}

/// Flatten tool-call content blocks to text.
fn content_text(content: &Value) -> Option<String> {
    let blocks = content.as_array()?;
    let parts: Vec<&str> = blocks
        .iter()
        .filter_map(|block| {
            block
                .pointer("/content/text")
                .or_else(|| block.get("text"))
                .and_then(Value::as_str)
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Decode a `session/update` notification.
pub fn parse_session_update(params: &Value) -> Option<RpcEvent> {
    let update = params.get("update")?;
    let kind = update.get("sessionUpdate")?.as_str()?;
    let text = || {
        update
            .pointer("/content/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match kind {
        "agent_message_chunk" => Some(RpcEvent::AgentMessageChunk(TextChunk::incremental(text()))),
        "agent_thought_chunk" => Some(RpcEvent::AgentThoughtChunk { text: text() }),
        "tool_call" => Some(RpcEvent::ToolCall {
            call_id: update.get("toolCallId")?.as_str()?.to_string(),
            title: update
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string(),
            kind: update.get("kind").and_then(Value::as_str).and_then(tool_kind),
            status: status(update.get("status")).unwrap_or(ToolCallStatus::Pending),
            raw_input: update.get("rawInput").cloned().unwrap_or(json!({})),
        }),
        "tool_call_update" => Some(RpcEvent::ToolCallUpdate {
            call_id: update.get("toolCallId")?.as_str()?.to_string(),
            status: status(update.get("status")),
            content: update.get("content").and_then(content_text),
        }),
        "plan" => Some(RpcEvent::Plan {
            entries: update
                .get("entries")
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| PlanEntry {
                            content: entry
                                .get("content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            status: entry
                                .get("status")
                                .and_then(Value::as_str)
                                .unwrap_or("pending")
                                .to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }),
        "available_commands_update" => Some(RpcEvent::AvailableCommands {
            commands: update
                .get("availableCommands")
                .and_then(Value::as_array)
                .map(|commands| {
                    commands
                        .iter()
                        .filter_map(|c| c.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }),
        other => {
            tracing::debug!(session_update = other, "Ignoring unknown session update");
            None
        }
    }
}

/// Decode a `session/request_permission` request.
pub fn parse_permission_request(request_id: &Value, params: &Value) -> Option<ConfirmationPrompt> {
    let tool_call = params.get("toolCall")?;
    let call_id = tool_call.get("toolCallId")?.as_str()?.to_string();
    let title = tool_call
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Permission required")
        .to_string();
    let raw_input = tool_call.get("rawInput").cloned().unwrap_or(Value::Null);
    let command = match raw_input.get("command") {
        Some(Value::String(command)) => Some(command.clone()),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    };
    let server = raw_input
        .get("serverName")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool_name = raw_input
        .get("toolName")
        .and_then(Value::as_str)
        .unwrap_or(&title)
        .to_string();

    let options = params
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| {
                    let value = option.get("optionId")?.as_str()?;
                    let label = option.get("name").and_then(Value::as_str).unwrap_or(value);
                    let kind = match option.get("kind").and_then(Value::as_str) {
                        Some("allow_once") => OptionKind::AllowOnce,
                        Some("allow_always") => OptionKind::AllowAlways,
                        Some("reject_once") | Some("reject_always") => OptionKind::Reject,
                        _ => OptionKind::classify(value),
                    };
                    Some(ConfirmationOption::new(label, value, kind))
                })
                .collect()
        })
        .unwrap_or_default();

    let request_id = match request_id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    };

    Some(ConfirmationPrompt {
        id: Some(request_id),
        call_id,
        tool_name,
        description: command.clone().unwrap_or_default(),
        title,
        kind: tool_call
            .get("kind")
            .and_then(Value::as_str)
            .and_then(tool_kind),
        command,
        server,
        options,
    })
}

/// Result payload answering a permission request.
pub fn permission_outcome(option_id: Option<&str>) -> Value {
    match option_id {
        Some(option_id) => json!({ "outcome": { "outcome": "selected", "optionId": option_id } }),
        None => json!({ "outcome": { "outcome": "cancelled" } }),
    }
}

/// Prompt content blocks for `session/prompt`.
pub fn prompt_blocks(text: &str, files: &[PathBuf]) -> Value {
    let mut blocks = vec![json!({ "type": "text", "text": text })];
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.display().to_string());
        blocks.push(json!({
            "type": "resource_link",
            "uri": format!("file://{}", file.display()),
            "name": name,
        }));
    }
    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_each_message_shape() {
        assert_eq!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"sessionId":"s1"}}"#).unwrap(),
            RpcMessage::Response {
                id: json!(3),
                result: Ok(json!({"sessionId": "s1"}))
            }
        );
        assert!(matches!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32000,"message":"no such session"}}"#).unwrap(),
            RpcMessage::Response { result: Err(RpcError { code: -32000, .. }), .. }
        ));
        assert!(matches!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","method":"session/update","params":{}}"#).unwrap(),
            RpcMessage::Notification { .. }
        ));
        assert!(matches!(
            RpcMessage::parse(r#"{"jsonrpc":"2.0","id":"p1","method":"session/request_permission","params":{}}"#).unwrap(),
            RpcMessage::Request { .. }
        ));
        assert!(RpcMessage::parse("{}").is_err());
        assert!(RpcMessage::parse("not json").is_err());
    }

    #[test]
    fn encodes_requests_as_single_lines() {
        let line = RpcMessage::request(1, "initialize", json!({"protocolVersion": 1})).to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "initialize");
    }

    #[test]
    fn decodes_session_updates() {
        let chunk = parse_session_update(&json!({
            "sessionId": "s",
            "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hi"}}
        }));
        assert_eq!(chunk, Some(RpcEvent::AgentMessageChunk(TextChunk::incremental("Hi"))));

        let call = parse_session_update(&json!({
            "update": {
                "sessionUpdate": "tool_call",
                "toolCallId": "t1",
                "title": "read_file",
                "kind": "read",
                "status": "in_progress",
                "rawInput": {"path": "a.rs"}
            }
        }));
        assert_eq!(
            call,
            Some(RpcEvent::ToolCall {
                call_id: "t1".into(),
                title: "read_file".into(),
                kind: Some(ToolKind::Read),
                status: ToolCallStatus::InProgress,
                raw_input: json!({"path": "a.rs"}),
            })
        );

        let update = parse_session_update(&json!({
            "update": {
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
                "content": [{"type": "content", "content": {"type": "text", "text": "42 lines"}}]
            }
        }));
        assert_eq!(
            update,
            Some(RpcEvent::ToolCallUpdate {
                call_id: "t1".into(),
                status: Some(ToolCallStatus::Completed),
                content: Some("42 lines".into()),
            })
        );
    }

    #[test]
    fn decodes_permission_request() {
        let prompt = parse_permission_request(
            &json!(7),
            &json!({
                "sessionId": "s",
                "toolCall": {
                    "toolCallId": "t9",
                    "title": "Shell",
                    "kind": "execute",
                    "rawInput": {"command": "git status"}
                },
                "options": [
                    {"optionId": "proceed_always", "name": "Always", "kind": "allow_always"},
                    {"optionId": "proceed_once", "name": "Once", "kind": "allow_once"},
                    {"optionId": "cancel", "name": "No", "kind": "reject_once"}
                ]
            }),
        )
        .unwrap();
        assert_eq!(prompt.id.as_deref(), Some("7"));
        assert_eq!(prompt.call_id, "t9");
        assert_eq!(prompt.kind, Some(ToolKind::Execute));
        assert_eq!(prompt.command.as_deref(), Some("git status"));
        assert_eq!(prompt.options[0].kind, OptionKind::AllowAlways);
        assert_eq!(prompt.options[2].kind, OptionKind::Reject);
    }

    #[test]
    fn permission_outcomes() {
        assert_eq!(
            permission_outcome(Some("proceed_once")),
            json!({"outcome": {"outcome": "selected", "optionId": "proceed_once"}})
        );
        assert_eq!(
            permission_outcome(None),
            json!({"outcome": {"outcome": "cancelled"}})
        );
    }
}
