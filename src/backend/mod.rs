//! Backend adapters and the raw events they emit.
//!
//! Adapters never call into the manager. Everything they observe is pushed
//! upward through an [`EventEmitter`]; the manager is the only caller of
//! `send`, `confirm` and `stop`.

pub mod openai;
pub mod sdk;

#[cfg(feature = "jsonrpc")]
pub mod jsonrpc;
#[cfg(feature = "jsonrpc")]
pub mod rpc;

#[cfg(feature = "gateway")]
pub mod gateway;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::types::{
    BackendKind, ConfirmationOption, ToolCall, ToolCallStatus, ToolKind,
};

/// How a text chunk relates to what came before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    /// The chunk repeats all text so far.
    Cumulative,
    /// The chunk is only the new text.
    Incremental,
}

/// Assistant text as emitted by a backend. `mode: None` means undeclared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub mode: Option<DeltaMode>,
}

impl TextChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: None,
        }
    }

    pub fn incremental(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: Some(DeltaMode::Incremental),
        }
    }

    pub fn cumulative(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mode: Some(DeltaMode::Cumulative),
        }
    }
}

/// A backend asking permission to run a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationPrompt {
    /// Backend-assigned request id; re-emission with the same id updates in place.
    pub id: Option<String>,
    pub call_id: String,
    pub tool_name: String,
    pub title: String,
    pub description: String,
    pub kind: Option<ToolKind>,
    /// Command line for exec-style tools.
    pub command: Option<String>,
    /// Originating tool server for external tools.
    pub server: Option<String>,
    pub options: Vec<ConfirmationOption>,
}

/// Events from the in-process SDK adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkEvent {
    Started,
    Content(TextChunk),
    Thought {
        subject: Option<String>,
        text: String,
    },
    ToolCallRequest(ToolCall),
    ToolCallResponse {
        call_id: String,
        name: String,
        status: ToolCallStatus,
        output: Option<String>,
    },
    ToolCallConfirmation(ConfirmationPrompt),
    InlineData {
        mime_type: String,
        data: Vec<u8>,
    },
    InvalidStream {
        reason: String,
    },
    Finished {
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}

/// One entry of an agent plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub content: String,
    pub status: String,
}

/// Session updates from a JSON-RPC agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    AgentMessageChunk(TextChunk),
    AgentThoughtChunk {
        text: String,
    },
    ToolCall {
        call_id: String,
        title: String,
        kind: Option<ToolKind>,
        status: ToolCallStatus,
        raw_input: serde_json::Value,
    },
    ToolCallUpdate {
        call_id: String,
        status: Option<ToolCallStatus>,
        content: Option<String>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    AvailableCommands {
        commands: Vec<String>,
    },
    PermissionRequest(ConfirmationPrompt),
    PromptFinished {
        stop_reason: String,
    },
}

/// Frames from a WebSocket gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Tick,
    Health,
    /// Full assistant text so far.
    ChatDelta {
        text: String,
    },
    ChatFinal {
        text: Option<String>,
    },
    ChatAborted,
    ChatError {
        message: String,
    },
    ToolStart {
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: Option<String>,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    ApprovalRequested(ConfirmationPrompt),
}

/// Transport-level conditions, shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Error { message: String },
    ConnectionLost { message: String },
    HeartbeatTimeout { elapsed_ms: u64 },
    InvalidStream { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Sdk(SdkEvent),
    Rpc(RpcEvent),
    Gateway(GatewayEvent),
    Signal(StreamSignal),
}

impl From<SdkEvent> for RawEvent {
    fn from(event: SdkEvent) -> Self {
        Self::Sdk(event)
    }
}

impl From<RpcEvent> for RawEvent {
    fn from(event: RpcEvent) -> Self {
        Self::Rpc(event)
    }
}

impl From<GatewayEvent> for RawEvent {
    fn from(event: GatewayEvent) -> Self {
        Self::Gateway(event)
    }
}

impl From<StreamSignal> for RawEvent {
    fn from(signal: StreamSignal) -> Self {
        Self::Signal(signal)
    }
}

/// A raw event tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub turn_id: Option<String>,
    pub raw: RawEvent,
}

/// Upward channel from an adapter to its manager.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<BackendEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event. A closed channel means the manager is gone; the event is dropped.
    pub fn emit(&self, turn_id: Option<&str>, raw: impl Into<RawEvent>) {
        let event = BackendEvent {
            turn_id: turn_id.map(str::to_string),
            raw: raw.into(),
        };
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One logical send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub turn_id: String,
    pub text: String,
    pub files: Vec<PathBuf>,
    /// Resend of the same logical message after an invalid stream.
    pub is_retry: bool,
}

/// Everything a factory needs to build a backend.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub conversation_id: String,
    pub config: Arc<RelayConfig>,
    /// Session key persisted by a previous run, for resume.
    pub session_key: Option<String>,
    pub events: EventEmitter,
}

/// Common contract of every adapter.
///
/// `send` returns once the message has been handed to the backend; the
/// reply arrives as events.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn start(&self) -> Result<()>;

    async fn send(&self, request: SendRequest) -> Result<()>;

    async fn confirm(&self, call_id: &str, option_id: &str) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Refuse a pending confirmation that offers no reject option.
    async fn reject(&self, call_id: &str) -> Result<()> {
        self.confirm(call_id, "cancel").await
    }

    /// Append a user-role entry to the backend's own history.
    async fn record_history(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    /// Session identity resolved at start, if the backend has one.
    fn session_key(&self) -> Option<String> {
        None
    }

    /// Release processes and sockets. Must be idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Builds the backend for a conversation.
pub trait BackendFactory: Send + Sync {
    fn build(&self, ctx: BackendContext) -> Result<Arc<dyn AgentBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn(BackendContext) -> Result<Arc<dyn AgentBackend>> + Send + Sync,
{
    fn build(&self, ctx: BackendContext) -> Result<Arc<dyn AgentBackend>> {
        self(ctx)
    }
}

/// Factory that picks the adapter named by `config.backend`.
pub struct ConfiguredFactory {
    model: Option<Arc<dyn sdk::ModelClient>>,
    tools: Arc<dyn sdk::ToolExecutor>,
}

impl ConfiguredFactory {
    /// Uses the OpenAI-compatible client for the in-process backend.
    pub fn new(tools: Arc<dyn sdk::ToolExecutor>) -> Self {
        Self { model: None, tools }
    }

    pub fn with_model(mut self, model: Arc<dyn sdk::ModelClient>) -> Self {
        self.model = Some(model);
        self
    }
}

impl BackendFactory for ConfiguredFactory {
    fn build(&self, ctx: BackendContext) -> Result<Arc<dyn AgentBackend>> {
        match ctx.config.backend {
            BackendKind::Sdk => {
                let model = match &self.model {
                    Some(model) => model.clone(),
                    None => Arc::new(openai::OpenAiClient::from_config(&ctx.config)?),
                };
                Ok(Arc::new(sdk::SdkBackend::new(ctx, model, self.tools.clone())))
            }
            #[cfg(feature = "jsonrpc")]
            BackendKind::Jsonrpc => Ok(Arc::new(jsonrpc::JsonRpcBackend::new(ctx)?)),
            #[cfg(feature = "gateway")]
            BackendKind::Gateway => Ok(Arc::new(gateway::GatewayBackend::new(ctx))),
            #[allow(unreachable_patterns)]
            other => Err(RelayError::Configuration(format!(
                "backend '{other}' is not enabled in this build"
            ))),
        }
    }
}
