//! In-process backend: drives a [`ModelClient`] and runs the tool loop locally.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    AgentBackend, BackendContext, ConfirmationPrompt, EventEmitter, SdkEvent, SendRequest,
    StreamSignal, TextChunk,
};
use crate::error::{RelayError, Result};
use crate::normalize::normalize_tool_args;
use crate::resilience::classify_error;
use crate::types::{BackendKind, ChatMessage, OptionKind, ToolCall, ToolCallStatus};

/// One increment of a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelDelta {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCall),
    InlineData { mime_type: String, data: Vec<u8> },
    Done { finish_reason: Option<String> },
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Streaming model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, request: ModelRequest)
        -> Result<BoxStream<'static, Result<ModelDelta>>>;
}

/// Executes tool calls requested by the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// A prompt when the call needs the caller's permission, `None` to run directly.
    fn confirmation_for(&self, call: &ToolCall) -> Option<ConfirmationPrompt>;

    async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> Result<String>;
}

/// Executor with no tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    fn confirmation_for(&self, _call: &ToolCall) -> Option<ConfirmationPrompt> {
        None
    }

    async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> Result<String> {
        Err(RelayError::ToolExecution {
            tool_name: call.name.clone(),
            message: "no tools are available".to_string(),
        })
    }
}

struct ActiveTurn {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    history: Mutex<Vec<ChatMessage>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<String>>>,
    active: Mutex<Option<ActiveTurn>>,
}

pub struct SdkBackend {
    conversation_id: String,
    system_prompt: Option<String>,
    max_iterations: usize,
    events: EventEmitter,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    shared: Arc<Shared>,
}

impl SdkBackend {
    pub fn new(
        ctx: BackendContext,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            conversation_id: ctx.conversation_id,
            system_prompt: ctx.config.system_prompt.clone(),
            max_iterations: ctx.config.max_tool_iterations.max(1),
            events: ctx.events,
            model,
            tools,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Snapshot of the history sent to the model.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.shared.history.lock().await.clone()
    }

    async fn cancel_active(&self) {
        if let Some(active) = self.shared.active.lock().await.take() {
            active.cancel.cancel();
        }
        // Dropping the senders rejects every waiting confirmation.
        self.shared.waiters.lock().await.clear();
    }
}

#[async_trait]
impl AgentBackend for SdkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sdk
    }

    async fn start(&self) -> Result<()> {
        tracing::debug!(conversation_id = %self.conversation_id, "SDK backend ready");
        Ok(())
    }

    async fn send(&self, request: SendRequest) -> Result<()> {
        self.cancel_active().await;

        if !request.is_retry {
            let mut text = request.text.clone();
            for file in &request.files {
                text.push_str(&format!("\n@{}", file.display()));
            }
            self.shared.history.lock().await.push(ChatMessage::user(text));
        }

        let cancel = CancellationToken::new();
        let turn = TurnRunner {
            conversation_id: self.conversation_id.clone(),
            turn_id: request.turn_id,
            system_prompt: self.system_prompt.clone(),
            max_iterations: self.max_iterations,
            events: self.events.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(turn.run());
        *self.shared.active.lock().await = Some(ActiveTurn { cancel, task });
        Ok(())
    }

    async fn confirm(&self, call_id: &str, option_id: &str) -> Result<()> {
        match self.shared.waiters.lock().await.remove(call_id) {
            Some(reply) => {
                let _ = reply.send(option_id.to_string());
            }
            None => tracing::debug!(call_id, "No tool call waiting for confirmation"),
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel_active().await;
        Ok(())
    }

    async fn record_history(&self, text: &str) -> Result<()> {
        self.shared
            .history
            .lock()
            .await
            .push(ChatMessage::user(text));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(active) = self.shared.active.lock().await.take() {
            active.cancel.cancel();
            active.task.abort();
        }
        self.shared.waiters.lock().await.clear();
        Ok(())
    }
}

/// Output of one model call.
#[derive(Default)]
struct Response {
    text: String,
    calls: Vec<ToolCall>,
    produced: bool,
    finish_reason: Option<String>,
    done: bool,
}

enum Outcome {
    Continue,
    Stop,
}

/// One turn of the model -> tool -> model loop.
struct TurnRunner {
    conversation_id: String,
    turn_id: String,
    system_prompt: Option<String>,
    max_iterations: usize,
    events: EventEmitter,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TurnRunner {
    fn emit(&self, event: SdkEvent) {
        self.events.emit(Some(&self.turn_id), event);
    }

    async fn run(self) {
        self.emit(SdkEvent::Started);

        for iteration in 0..self.max_iterations {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                turn_id = %self.turn_id,
                iteration,
                "Model call"
            );
            let response = match self.call_model().await {
                Ok(Some(response)) => response,
                Ok(None) => return self.finish_canceled(),
                Err(e) => return self.fail(e),
            };

            if !response.produced && response.calls.is_empty() && !response.done {
                self.emit(SdkEvent::InvalidStream {
                    reason: "model returned an empty response".to_string(),
                });
                return;
            }

            self.shared
                .history
                .lock()
                .await
                .push(ChatMessage::assistant(&response.text, &response.calls));

            if response.calls.is_empty() {
                self.emit(SdkEvent::Finished {
                    reason: response.finish_reason,
                });
                return;
            }

            for call in response.calls {
                if let Outcome::Stop = self.run_tool(call).await {
                    return self.finish_canceled();
                }
            }
        }

        self.emit(SdkEvent::Error {
            message: format!("Stopped after {} tool iterations", self.max_iterations),
        });
        self.emit(SdkEvent::Finished {
            reason: Some("max_iterations".to_string()),
        });
    }

    /// `Ok(None)` when cancelled.
    async fn call_model(&self) -> Result<Option<Response>> {
        let request = self.build_request().await;
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            stream = self.model.stream(request) => stream?,
        };

        let mut response = Response::default();
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            match item? {
                ModelDelta::Text(text) => {
                    response.produced = true;
                    response.text.push_str(&text);
                    self.emit(SdkEvent::Content(TextChunk::incremental(text)));
                }
                ModelDelta::Reasoning(text) => {
                    response.produced = true;
                    self.emit(SdkEvent::Thought {
                        subject: None,
                        text,
                    });
                }
                ModelDelta::ToolCall(call) => response.calls.push(call),
                ModelDelta::InlineData { mime_type, data } => {
                    response.produced = true;
                    self.emit(SdkEvent::InlineData { mime_type, data });
                }
                ModelDelta::Done { finish_reason } => {
                    response.done = true;
                    response.finish_reason = finish_reason;
                }
            }
        }
        Ok(Some(response))
    }

    async fn build_request(&self) -> ModelRequest {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(self.shared.history.lock().await.iter().cloned());
        ModelRequest {
            conversation_id: self.conversation_id.clone(),
            messages,
            tools: self.tools.definitions(),
        }
    }

    async fn run_tool(&self, call: ToolCall) -> Outcome {
        let call = ToolCall {
            arguments: normalize_tool_args(&call.name, call.arguments),
            ..call
        };
        self.emit(SdkEvent::ToolCallRequest(call.clone()));

        if let Some(prompt) = self.tools.confirmation_for(&call) {
            let (reply, answer) = oneshot::channel();
            self.shared
                .waiters
                .lock()
                .await
                .insert(call.id.clone(), reply);
            self.emit(SdkEvent::ToolCallConfirmation(prompt.clone()));

            let answer = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stop,
                answer = answer => answer.ok(),
            };
            let rejected = match &answer {
                Some(value) => option_kind(&prompt, value) == OptionKind::Reject,
                None => true,
            };
            if rejected {
                tracing::info!(call_id = %call.id, tool = %call.name, "Tool call rejected");
                self.respond(&call, ToolCallStatus::Canceled, "Tool call was rejected by the user.")
                    .await;
                return Outcome::Continue;
            }
        }

        self.emit(SdkEvent::ToolCallResponse {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status: ToolCallStatus::InProgress,
            output: None,
        });

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Stop,
            result = self.tools.execute(&call, self.cancel.child_token()) => result,
        };
        match result {
            Ok(output) => {
                self.respond(&call, ToolCallStatus::Completed, &output).await;
            }
            Err(e) => {
                tracing::warn!(call_id = %call.id, tool = %call.name, error = %e, "Tool failed");
                let message = e.to_string();
                self.emit(SdkEvent::Error {
                    message: message.clone(),
                });
                self.respond(&call, ToolCallStatus::Failed, &format!("Error: {message}"))
                    .await;
            }
        }
        Outcome::Continue
    }

    async fn respond(&self, call: &ToolCall, status: ToolCallStatus, output: &str) {
        self.emit(SdkEvent::ToolCallResponse {
            call_id: call.id.clone(),
            name: call.name.clone(),
            status,
            output: Some(output.to_string()),
        });
        self.shared
            .history
            .lock()
            .await
            .push(ChatMessage::tool_result(&call.id, output));
    }

    fn finish_canceled(&self) {
        self.emit(SdkEvent::Finished {
            reason: Some("canceled".to_string()),
        });
    }

    fn fail(&self, error: RelayError) {
        match classify_error(&error) {
            StreamSignal::InvalidStream { reason } => {
                self.emit(SdkEvent::InvalidStream { reason });
            }
            signal @ StreamSignal::ConnectionLost { .. } => {
                self.events.emit(Some(&self.turn_id), signal);
            }
            _ => {
                self.emit(SdkEvent::Error {
                    message: error.to_string(),
                });
                self.emit(SdkEvent::Finished {
                    reason: Some("error".to_string()),
                });
            }
        }
    }
}

fn option_kind(prompt: &ConfirmationPrompt, value: &str) -> OptionKind {
    prompt
        .options
        .iter()
        .find(|option| option.value == value)
        .map(|option| option.kind)
        .unwrap_or_else(|| OptionKind::classify(value))
}
