//! Raw backend events to canonical events.
//!
//! One exhaustive match per backend. An empty result means the event was
//! dropped on purpose (health checks, command lists).

pub mod delta;
pub mod media;
pub mod smuggled;
pub mod think;
pub mod tool_args;

pub use delta::DeltaExtractor;
pub use media::{extension_for_mime, markdown_image, MediaWriter};
pub use smuggled::{extract_smuggled_calls, may_be_smuggled};
pub use think::{strip_think_tags, Segment, ThinkFilter};
pub use tool_args::normalize_tool_args;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::approval::root_commands;
use crate::backend::{
    ConfirmationPrompt, GatewayEvent, PlanEntry, RawEvent, RpcEvent, SdkEvent, StreamSignal,
    TextChunk,
};
use crate::error::RelayError;
use crate::types::{
    default_options, CanonicalEvent, Confirmation, ConfirmationAction, ConnectionState, ToolCall,
    ToolCallStatus, ToolKind,
};

/// What the turn's text has turned out to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum TextShape {
    /// Nothing emitted yet; the text could still be a tool-call payload.
    #[default]
    Undecided,
    Visible,
    ToolCalls,
}

/// Stateful per-conversation normalizer.
#[derive(Debug)]
pub struct Normalizer {
    delta: DeltaExtractor,
    think: ThinkFilter,
    media: MediaWriter,
    shape: TextShape,
    /// JSON-RPC updates carry only the call id.
    rpc_tool_names: HashMap<String, String>,
}

impl Normalizer {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            delta: DeltaExtractor::new(),
            think: ThinkFilter::new(),
            media: MediaWriter::new(working_dir),
            shape: TextShape::Undecided,
            rpc_tool_names: HashMap::new(),
        }
    }

    /// Forget per-turn text state.
    pub fn reset(&mut self) {
        self.delta.reset();
        self.think.reset();
        self.shape = TextShape::Undecided;
        self.rpc_tool_names.clear();
    }

    pub async fn normalize(&mut self, raw: RawEvent) -> Vec<CanonicalEvent> {
        match raw {
            RawEvent::Sdk(event) => self.normalize_sdk(event).await,
            RawEvent::Rpc(event) => self.normalize_rpc(event),
            RawEvent::Gateway(event) => self.normalize_gateway(event),
            RawEvent::Signal(signal) => self.normalize_signal(signal),
        }
    }

    /// Release held-back text at the end of a turn.
    pub fn finish_turn(&mut self) -> Vec<CanonicalEvent> {
        let mut events = match self.shape {
            TextShape::Undecided => self.settle(true),
            TextShape::Visible | TextShape::ToolCalls => Vec::new(),
        };
        events.extend(segments_to_events(self.think.flush()));
        self.delta.reset();
        self.shape = TextShape::Undecided;
        events
    }

    async fn normalize_sdk(&mut self, event: SdkEvent) -> Vec<CanonicalEvent> {
        match event {
            SdkEvent::Started => vec![CanonicalEvent::Start],
            SdkEvent::Content(chunk) => self.text(chunk),
            SdkEvent::Thought { subject, text } => {
                vec![CanonicalEvent::Thought { subject, text }]
            }
            SdkEvent::ToolCallRequest(call) => tool_request(call),
            SdkEvent::ToolCallResponse {
                call_id,
                name,
                status,
                output,
            } => vec![CanonicalEvent::ToolCallUpdate {
                call_id,
                kind: ToolKind::infer(&name),
                name: Some(name),
                status,
                output,
            }],
            SdkEvent::ToolCallConfirmation(prompt) => vec![confirmation_request(prompt)],
            SdkEvent::InlineData { mime_type, data } => {
                match self.media.write(&mime_type, &data).await {
                    Ok(relative) => vec![CanonicalEvent::content(markdown_image(&relative))],
                    Err(e) => {
                        tracing::warn!(error = %e, mime_type, "Failed to persist inline payload");
                        vec![CanonicalEvent::error(format!(
                            "Failed to save inline {mime_type} payload: {e}"
                        ))]
                    }
                }
            }
            // Retry is decided by the manager before normalization.
            SdkEvent::InvalidStream { reason } => {
                tracing::debug!(reason, "Invalid stream reached normalizer");
                Vec::new()
            }
            SdkEvent::Finished { reason } => {
                tracing::debug!(reason = ?reason, "SDK stream finished");
                self.finish()
            }
            SdkEvent::Error { message } => vec![CanonicalEvent::Error { message }],
        }
    }

    fn normalize_rpc(&mut self, event: RpcEvent) -> Vec<CanonicalEvent> {
        match event {
            RpcEvent::AgentMessageChunk(chunk) => self.text(chunk),
            RpcEvent::AgentThoughtChunk { text } => vec![CanonicalEvent::thought(text)],
            RpcEvent::ToolCall {
                call_id,
                title,
                kind,
                status,
                raw_input,
            } => {
                let kind = kind.or_else(|| ToolKind::infer(&title));
                self.rpc_tool_names.insert(call_id.clone(), title.clone());
                let args = normalize_tool_args(&title, raw_input);
                let mut events = vec![CanonicalEvent::ToolCallRequest {
                    call_id: call_id.clone(),
                    name: title.clone(),
                    args,
                }];
                if status != ToolCallStatus::Pending || kind.is_some() {
                    let failure = (status == ToolCallStatus::Failed)
                        .then(|| tool_failure(&title, None));
                    events.push(CanonicalEvent::ToolCallUpdate {
                        call_id,
                        name: Some(title),
                        status,
                        kind,
                        output: None,
                    });
                    events.extend(failure);
                }
                events
            }
            RpcEvent::ToolCallUpdate {
                call_id,
                status,
                content,
            } => {
                let status = status.unwrap_or(ToolCallStatus::InProgress);
                let failure = (status == ToolCallStatus::Failed).then(|| {
                    let name = self.rpc_tool_names.get(&call_id).unwrap_or(&call_id);
                    tool_failure(name, content.as_deref())
                });
                let mut events = vec![CanonicalEvent::ToolCallUpdate {
                    call_id,
                    name: None,
                    status,
                    kind: None,
                    output: content,
                }];
                events.extend(failure);
                events
            }
            RpcEvent::Plan { entries } => {
                if entries.is_empty() {
                    Vec::new()
                } else {
                    vec![CanonicalEvent::Thought {
                        subject: Some("Plan".to_string()),
                        text: format_plan(&entries),
                    }]
                }
            }
            RpcEvent::AvailableCommands { commands } => {
                tracing::trace!(count = commands.len(), "Dropping available commands update");
                Vec::new()
            }
            RpcEvent::PermissionRequest(prompt) => vec![confirmation_request(prompt)],
            RpcEvent::PromptFinished { stop_reason } => {
                tracing::debug!(stop_reason, "Prompt finished");
                self.finish()
            }
        }
    }

    fn normalize_gateway(&mut self, event: GatewayEvent) -> Vec<CanonicalEvent> {
        match event {
            GatewayEvent::Tick | GatewayEvent::Health => Vec::new(),
            GatewayEvent::ChatDelta { text } => self.text(TextChunk::cumulative(text)),
            GatewayEvent::ChatFinal { text } => {
                let mut events = match text {
                    Some(text) => self.text(TextChunk::cumulative(text)),
                    None => Vec::new(),
                };
                events.extend(self.finish());
                events
            }
            GatewayEvent::ChatAborted => self.finish(),
            GatewayEvent::ChatError { message } => {
                let mut events = self.finish_turn();
                events.push(CanonicalEvent::Error { message });
                events.push(CanonicalEvent::Finish);
                events
            }
            GatewayEvent::ToolStart {
                call_id,
                name,
                args,
            } => {
                let mut events = tool_request(ToolCall::new(call_id.clone(), name.clone(), args));
                events.push(CanonicalEvent::ToolCallUpdate {
                    call_id,
                    kind: ToolKind::infer(&name),
                    name: Some(name),
                    status: ToolCallStatus::InProgress,
                    output: None,
                });
                events
            }
            GatewayEvent::ToolResult {
                call_id,
                name,
                output,
                is_error,
            } => {
                let failure = is_error.then(|| tool_failure(&name, output.as_deref()));
                let mut events = vec![CanonicalEvent::ToolCallUpdate {
                    call_id,
                    kind: ToolKind::infer(&name),
                    status: if is_error {
                        ToolCallStatus::Failed
                    } else {
                        ToolCallStatus::Completed
                    },
                    name: Some(name),
                    output,
                }];
                events.extend(failure);
                events
            }
            GatewayEvent::Thinking { text } => vec![CanonicalEvent::thought(text)],
            GatewayEvent::ApprovalRequested(prompt) => vec![confirmation_request(prompt)],
        }
    }

    fn normalize_signal(&mut self, signal: StreamSignal) -> Vec<CanonicalEvent> {
        match signal {
            StreamSignal::Error { message } => vec![CanonicalEvent::Error { message }],
            StreamSignal::ConnectionLost { message } => vec![
                CanonicalEvent::AgentStatus {
                    state: ConnectionState::Failed,
                    message: Some(message.clone()),
                },
                CanonicalEvent::error(format!("Connection lost: {message}")),
            ],
            StreamSignal::HeartbeatTimeout { elapsed_ms } => vec![CanonicalEvent::AgentStatus {
                state: ConnectionState::Degraded,
                message: Some(format!("No events from backend for {}s", elapsed_ms / 1000)),
            }],
            StreamSignal::InvalidStream { reason } => {
                tracing::debug!(reason, "Invalid stream signal reached normalizer");
                Vec::new()
            }
        }
    }

    fn text(&mut self, chunk: TextChunk) -> Vec<CanonicalEvent> {
        let delta = self.delta.extract(&chunk);
        if delta.is_empty() {
            return Vec::new();
        }
        match self.shape {
            TextShape::Visible => segments_to_events(self.think.push(&delta)),
            TextShape::ToolCalls => {
                tracing::debug!(len = delta.len(), "Dropping text after smuggled tool calls");
                Vec::new()
            }
            TextShape::Undecided => self.settle(false),
        }
    }

    /// Decide an undecided turn from its accumulated text. Nothing has been
    /// emitted yet, so the whole accumulation is released when it is visible.
    fn settle(&mut self, at_end: bool) -> Vec<CanonicalEvent> {
        let accumulated = self.delta.accumulated();
        if accumulated.is_empty() {
            return Vec::new();
        }
        if let Some(calls) = extract_smuggled_calls(accumulated) {
            tracing::debug!(count = calls.len(), "Tool calls smuggled in content");
            self.shape = TextShape::ToolCalls;
            return calls.into_iter().flat_map(tool_request).collect();
        }
        if !at_end && may_be_smuggled(accumulated) {
            return Vec::new();
        }
        let text = accumulated.to_string();
        self.shape = TextShape::Visible;
        segments_to_events(self.think.push(&text))
    }

    fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut events = self.finish_turn();
        events.push(CanonicalEvent::Finish);
        events
    }
}

fn segments_to_events(segments: Vec<Segment>) -> Vec<CanonicalEvent> {
    segments
        .into_iter()
        .map(|segment| match segment {
            Segment::Visible(text) => CanonicalEvent::Content { text },
            Segment::Thought(text) => CanonicalEvent::thought(text),
        })
        .collect()
}

fn tool_request(call: ToolCall) -> Vec<CanonicalEvent> {
    let args = normalize_tool_args(&call.name, call.arguments);
    vec![CanonicalEvent::ToolCallRequest {
        call_id: call.id,
        name: call.name,
        args,
    }]
}

/// Error event for a tool the backend reported as failed.
fn tool_failure(tool_name: &str, output: Option<&str>) -> CanonicalEvent {
    let error = RelayError::ToolExecution {
        tool_name: tool_name.to_string(),
        message: output
            .filter(|output| !output.trim().is_empty())
            .unwrap_or("the tool reported a failure")
            .to_string(),
    };
    CanonicalEvent::error(error.to_string())
}

fn format_plan(entries: &[PlanEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("- [{}] {}", entry.status, entry.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build a confirmation from a backend prompt.
pub fn confirmation_from_prompt(prompt: ConfirmationPrompt) -> Confirmation {
    let kind = prompt.kind.or_else(|| ToolKind::infer(&prompt.tool_name));
    let action = match (&prompt.server, &prompt.command) {
        (Some(_), _) => ConfirmationAction::Mcp,
        (None, Some(_)) => ConfirmationAction::Exec,
        (None, None) => ConfirmationAction::from_tool_kind(kind),
    };
    let command_type = match action {
        ConfirmationAction::Exec => prompt
            .command
            .as_deref()
            .map(root_commands)
            .filter(|roots| !roots.is_empty())
            .map(|roots| roots.join(",")),
        ConfirmationAction::Mcp => Some(match &prompt.server {
            Some(server) => format!("{server}:{}", prompt.tool_name),
            None => prompt.tool_name.clone(),
        }),
        ConfirmationAction::Edit | ConfirmationAction::Info => None,
    };
    let options = if prompt.options.is_empty() {
        default_options()
    } else {
        prompt.options
    };
    let description = match (&prompt.command, prompt.description.is_empty()) {
        (Some(command), true) => command.clone(),
        _ => prompt.description,
    };

    Confirmation {
        id: prompt.id.unwrap_or_else(|| prompt.call_id.clone()),
        call_id: prompt.call_id,
        title: prompt.title,
        description,
        action,
        command_type,
        options,
    }
}

fn confirmation_request(prompt: ConfirmationPrompt) -> CanonicalEvent {
    CanonicalEvent::ConfirmationRequest {
        confirmation: confirmation_from_prompt(prompt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(std::env::temp_dir())
    }

    fn prompt(command: Option<&str>, server: Option<&str>) -> ConfirmationPrompt {
        ConfirmationPrompt {
            id: None,
            call_id: "call-1".into(),
            tool_name: "run_shell_command".into(),
            title: "Run".into(),
            description: String::new(),
            kind: None,
            command: command.map(str::to_string),
            server: server.map(str::to_string),
            options: Vec::new(),
        }
    }

    #[tokio::test]
    async fn smuggled_tool_calls_replace_content() {
        let mut n = normalizer();
        let events = n
            .normalize(RawEvent::Sdk(SdkEvent::Content(TextChunk::new(
                r#"{"tool_calls":[{"id":"c9","function":{"name":"read_file","arguments":{"path":"@a.rs"}}}]}"#,
            ))))
            .await;
        assert_eq!(
            events,
            vec![CanonicalEvent::ToolCallRequest {
                call_id: "c9".into(),
                name: "read_file".into(),
                args: json!({"file_path": "a.rs"}),
            }]
        );
    }

    const SMUGGLED: &str = r#"{"tool_calls":[{"id":"c1","function":{"name":"ls","arguments":{"dir":"src"}}}]}"#;

    fn ls_request() -> CanonicalEvent {
        CanonicalEvent::ToolCallRequest {
            call_id: "c1".into(),
            name: "ls".into(),
            args: json!({"dir_path": "src"}),
        }
    }

    #[tokio::test]
    async fn cumulative_smuggled_payload_never_leaks_as_content() {
        let mut n = normalizer();
        let mut events = Vec::new();
        for text in [&SMUGGLED[..15], &SMUGGLED[..40], SMUGGLED] {
            events.extend(
                n.normalize(RawEvent::Gateway(GatewayEvent::ChatDelta { text: text.into() }))
                    .await,
            );
        }
        events.extend(
            n.normalize(RawEvent::Gateway(GatewayEvent::ChatFinal {
                text: Some(SMUGGLED.into()),
            }))
            .await,
        );
        assert_eq!(events, vec![ls_request(), CanonicalEvent::Finish]);
    }

    #[tokio::test]
    async fn incremental_smuggled_payload_is_detected_across_chunks() {
        let mut n = normalizer();
        let (head, tail) = SMUGGLED.split_at(30);
        let mut events = Vec::new();
        for part in ["```json\n", head, tail, "\n```"] {
            events.extend(
                n.normalize(RawEvent::Sdk(SdkEvent::Content(TextChunk::incremental(part))))
                    .await,
            );
        }
        events.extend(n.finish_turn());
        assert_eq!(events, vec![ls_request()]);
    }

    #[tokio::test]
    async fn json_that_is_not_a_tool_call_is_released() {
        let mut n = normalizer();
        let first = n
            .normalize(RawEvent::Sdk(SdkEvent::Content(TextChunk::incremental(r#"{"answer":"#))))
            .await;
        assert!(first.is_empty());
        let second = n
            .normalize(RawEvent::Sdk(SdkEvent::Content(TextChunk::incremental(" 42} done"))))
            .await;
        assert!(second.is_empty());
        assert_eq!(
            n.finish_turn(),
            vec![CanonicalEvent::content(r#"{"answer": 42} done"#)]
        );
    }

    #[tokio::test]
    async fn gateway_tool_failure_surfaces_an_error() {
        let mut n = normalizer();
        let events = n
            .normalize(RawEvent::Gateway(GatewayEvent::ToolResult {
                call_id: "t1".into(),
                name: "exec".into(),
                output: Some("exit status 2".into()),
                is_error: true,
            }))
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CanonicalEvent::ToolCallUpdate { status: ToolCallStatus::Failed, .. }
        ));
        assert_eq!(
            events[1],
            CanonicalEvent::error("Tool execution error: exec: exit status 2")
        );
    }

    #[tokio::test]
    async fn rpc_tool_failure_names_the_tool() {
        let mut n = normalizer();
        n.normalize(RawEvent::Rpc(RpcEvent::ToolCall {
            call_id: "call-1".into(),
            title: "Run tests".into(),
            kind: Some(ToolKind::Execute),
            status: ToolCallStatus::InProgress,
            raw_input: json!({"command": "cargo test"}),
        }))
        .await;
        let events = n
            .normalize(RawEvent::Rpc(RpcEvent::ToolCallUpdate {
                call_id: "call-1".into(),
                status: Some(ToolCallStatus::Failed),
                content: None,
            }))
            .await;
        assert_eq!(
            events.last(),
            Some(&CanonicalEvent::error(
                "Tool execution error: Run tests: the tool reported a failure"
            ))
        );
    }

    #[tokio::test]
    async fn successful_tool_result_has_no_error() {
        let mut n = normalizer();
        let events = n
            .normalize(RawEvent::Gateway(GatewayEvent::ToolResult {
                call_id: "t1".into(),
                name: "exec".into(),
                output: Some("ok".into()),
                is_error: false,
            }))
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn think_spans_become_thoughts() {
        let mut n = normalizer();
        let events = n
            .normalize(RawEvent::Rpc(RpcEvent::AgentMessageChunk(
                TextChunk::incremental("<think>hmm</think>Hi"),
            )))
            .await;
        assert_eq!(
            events,
            vec![CanonicalEvent::thought("hmm"), CanonicalEvent::content("Hi")]
        );
    }

    #[tokio::test]
    async fn gateway_cumulative_deltas_and_final() {
        let mut n = normalizer();
        let mut events = Vec::new();
        for text in ["Hel", "Hello", "Hello!"] {
            events.extend(
                n.normalize(RawEvent::Gateway(GatewayEvent::ChatDelta { text: text.into() }))
                    .await,
            );
        }
        events.extend(
            n.normalize(RawEvent::Gateway(GatewayEvent::ChatFinal {
                text: Some("Hello!".into()),
            }))
            .await,
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::content("Hel"),
                CanonicalEvent::content("lo"),
                CanonicalEvent::content("!"),
                CanonicalEvent::Finish,
            ]
        );
    }

    #[tokio::test]
    async fn health_events_are_dropped() {
        let mut n = normalizer();
        assert!(n.normalize(RawEvent::Gateway(GatewayEvent::Tick)).await.is_empty());
        assert!(n
            .normalize(RawEvent::Rpc(RpcEvent::AvailableCommands {
                commands: vec!["init".into()]
            }))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn finish_flushes_held_back_text() {
        let mut n = normalizer();
        let first = n
            .normalize(RawEvent::Sdk(SdkEvent::Content(TextChunk::incremental("a <"))))
            .await;
        assert_eq!(first, vec![CanonicalEvent::content("a ")]);
        let last = n
            .normalize(RawEvent::Sdk(SdkEvent::Finished { reason: None }))
            .await;
        assert_eq!(last, vec![CanonicalEvent::content("<"), CanonicalEvent::Finish]);
    }

    #[tokio::test]
    async fn inline_data_is_written_and_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new(dir.path());
        let events = n
            .normalize(RawEvent::Sdk(SdkEvent::InlineData {
                mime_type: "image/jpeg".into(),
                data: vec![0xff, 0xd8],
            }))
            .await;
        let CanonicalEvent::Content { text } = &events[0] else {
            panic!("expected content, got {events:?}");
        };
        assert!(text.starts_with("![image](img-") && text.ends_with(".jpg)"), "{text}");
    }

    #[test]
    fn exec_prompt_derives_root_commands() {
        let conf = confirmation_from_prompt(prompt(Some("git add . && git commit"), None));
        assert_eq!(conf.action, ConfirmationAction::Exec);
        assert_eq!(conf.command_type.as_deref(), Some("git"));
        assert_eq!(conf.id, "call-1");
        assert_eq!(conf.options.len(), 3);
        assert_eq!(conf.description, "git add . && git commit");
    }

    #[test]
    fn server_prompt_is_mcp() {
        let mut p = prompt(None, Some("github"));
        p.tool_name = "create_issue".into();
        let conf = confirmation_from_prompt(p);
        assert_eq!(conf.action, ConfirmationAction::Mcp);
        assert_eq!(conf.command_type.as_deref(), Some("github:create_issue"));
    }
}
