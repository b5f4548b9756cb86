//! WebSocket gateway backend.
//!
//! The gateway is a long-lived local service. On start the adapter reuses one
//! already listening on the configured port, otherwise spawns the configured
//! command and polls the port until it accepts connections.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    AgentBackend, BackendContext, ConfirmationPrompt, EventEmitter, GatewayEvent, SendRequest,
    StreamSignal,
};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::resilience::{with_timeout, RetryPolicy};
use crate::types::{BackendKind, ConfirmationOption, OptionKind, ToolKind};

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<std::result::Result<Value, String>>;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether something accepts TCP connections at `address`.
pub async fn port_open(address: &str) -> bool {
    matches!(
        time::timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Flatten a chat message payload to its text.
fn message_text(message: &Value) -> Option<String> {
    match message {
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => match message.get("content")? {
            Value::String(text) => Some(text.clone()),
            Value::Array(blocks) => {
                let text: String = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                Some(text)
            }
            _ => None,
        },
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn approval_prompt(payload: &Value) -> Option<ConfirmationPrompt> {
    let id = payload.get("id")?.as_str()?.to_string();
    let request = payload.get("request").unwrap_or(&Value::Null);
    let command = request
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let cwd = request.get("cwd").and_then(Value::as_str);

    Some(ConfirmationPrompt {
        id: Some(id.clone()),
        call_id: id,
        tool_name: "exec".into(),
        title: "Run command".into(),
        description: match cwd {
            Some(cwd) => format!("{command}\n(in {cwd})"),
            None => command.clone(),
        },
        kind: Some(ToolKind::Execute),
        command: Some(command),
        server: None,
        options: vec![
            ConfirmationOption::new("Allow once", "allow-once", OptionKind::AllowOnce),
            ConfirmationOption::new("Always allow", "allow-always", OptionKind::AllowAlways),
            ConfirmationOption::new("Deny", "deny", OptionKind::Reject),
        ],
    })
}

/// Decode an `event` frame. Frames for other sessions yield `None`.
pub fn parse_event(name: &str, payload: &Value, session_key: &str) -> Option<GatewayEvent> {
    let foreign = |value: &Value| {
        value
            .get("sessionKey")
            .and_then(Value::as_str)
            .is_some_and(|key| key != session_key)
    };

    match name {
        "tick" => Some(GatewayEvent::Tick),
        "health" => Some(GatewayEvent::Health),
        "chat" if foreign(payload) => None,
        "chat" => {
            let text = payload.get("message").and_then(message_text);
            match payload.get("state").and_then(Value::as_str)? {
                "delta" => Some(GatewayEvent::ChatDelta {
                    text: text.unwrap_or_default(),
                }),
                "final" => Some(GatewayEvent::ChatFinal { text }),
                "aborted" => Some(GatewayEvent::ChatAborted),
                "error" => Some(GatewayEvent::ChatError {
                    message: payload
                        .get("errorMessage")
                        .and_then(Value::as_str)
                        .unwrap_or("gateway reported an error")
                        .to_string(),
                }),
                _ => None,
            }
        }
        "agent" if foreign(payload) => None,
        "agent" => {
            let data = payload.get("data")?;
            match payload.get("stream").and_then(Value::as_str)? {
                "tool" => {
                    let call_id = data.get("toolCallId")?.as_str()?.to_string();
                    let name = data
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("tool")
                        .to_string();
                    match data.get("phase").and_then(Value::as_str)? {
                        "start" => Some(GatewayEvent::ToolStart {
                            call_id,
                            name,
                            args: data.get("args").cloned().unwrap_or(json!({})),
                        }),
                        "result" => Some(GatewayEvent::ToolResult {
                            call_id,
                            name,
                            output: data.get("result").map(stringify),
                            is_error: data
                                .get("isError")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        }),
                        _ => None,
                    }
                }
                "thinking" => Some(GatewayEvent::Thinking {
                    text: data.get("text").and_then(Value::as_str)?.to_string(),
                }),
                _ => None,
            }
        }
        "exec.approval.requested" => approval_prompt(payload).map(GatewayEvent::ApprovalRequested),
        other => {
            tracing::trace!(event = other, "Ignoring gateway event");
            None
        }
    }
}

/// A live socket: frames go out through `outgoing`, `res` frames resolve `pending`.
struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Arc<StdMutex<HashMap<String, Responder>>>,
}

impl Connection {
    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        let frame = json!({ "type": "req", "id": id, "method": method, "params": params });
        if self.outgoing.send(Message::Text(frame.to_string())).is_err() {
            lock(&self.pending).remove(&id);
            return Err(RelayError::Transport("gateway connection closed".into()));
        }

        let answer = with_timeout(timeout, async {
            rx.await
                .map_err(|_| RelayError::Transport(format!("connection reset during {method}")))
        })
        .await;
        if answer.is_err() {
            lock(&self.pending).remove(&id);
        }
        answer?.map_err(|message| RelayError::Protocol(format!("{method} failed: {message}")))
    }
}

/// State the socket task needs.
struct Runtime {
    socket: GatewaySocket,
    outgoing: mpsc::UnboundedReceiver<Message>,
    pending: Arc<StdMutex<HashMap<String, Responder>>>,
    events: EventEmitter,
    turn: Arc<StdMutex<Option<String>>>,
    session_key: String,
    ping_interval: Duration,
    cancel: CancellationToken,
}

impl Runtime {
    fn emit(&self, raw: impl Into<super::RawEvent>) {
        let turn = lock(&self.turn).clone();
        self.events.emit(turn.as_deref(), raw);
    }

    async fn run(mut self) {
        let mut ping = time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.socket.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    if let Err(e) = self.socket.send(Message::Ping(Default::default())).await {
                        break format!("gateway ping failed: {e}");
                    }
                }
                frame = self.outgoing.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = self.socket.send(frame).await {
                        break format!("gateway send failed: {e}");
                    }
                }
                frame = self.socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_ref()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = self.socket.send(Message::Pong(payload)).await {
                            break format!("gateway pong failed: {e}");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "gateway closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("connection reset: {e}"),
                },
            }
        };

        lock(&self.pending).clear();
        if !self.cancel.is_cancelled() {
            tracing::warn!(reason, "Gateway connection lost");
            self.emit(StreamSignal::ConnectionLost { message: reason });
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparseable gateway frame");
                return;
            }
        };

        match frame.get("type").and_then(Value::as_str) {
            Some("res") => {
                let Some(id) = frame.get("id").and_then(Value::as_str) else {
                    return;
                };
                let Some(responder) = lock(&self.pending).remove(id) else {
                    tracing::debug!(id, "Response for unknown gateway request");
                    return;
                };
                let _ = responder.send(response_result(&frame));
            }
            Some("event") => {
                let name = frame.get("event").and_then(Value::as_str).unwrap_or_default();
                let payload = frame.get("payload").unwrap_or(&Value::Null);
                if let Some(event) = parse_event(name, payload, &self.session_key) {
                    self.emit(event);
                }
            }
            other => tracing::debug!(frame_type = ?other, "Ignoring gateway frame"),
        }
    }
}

fn response_result(frame: &Value) -> std::result::Result<Value, String> {
    if frame.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        Ok(frame.get("payload").cloned().unwrap_or(Value::Null))
    } else {
        Err(frame
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("request rejected")
            .to_string())
    }
}

/// Connect and complete the `connect` handshake before handing the socket off.
async fn open_socket(url: &str, token: Option<&str>) -> Result<GatewaySocket> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| RelayError::Transport(format!("gateway connect failed: {e}")))?;

    let id = uuid::Uuid::new_v4().to_string();
    let hello = json!({
        "type": "req",
        "id": id,
        "method": "connect",
        "params": {
            "client": { "name": "agent-relay", "version": env!("CARGO_PKG_VERSION") },
            "auth": { "token": token },
        }
    });
    socket
        .send(Message::Text(hello.to_string()))
        .await
        .map_err(|e| RelayError::Transport(format!("gateway handshake failed: {e}")))?;

    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|e| RelayError::Transport(format!("gateway handshake failed: {e}")))?;
        let Message::Text(text) = frame else { continue };
        let value: Value = serde_json::from_str(text.as_ref())?;
        let is_answer = value.get("type").and_then(Value::as_str) == Some("res")
            && value.get("id").and_then(Value::as_str) == Some(id.as_str());
        if is_answer {
            return match response_result(&value) {
                Ok(_) => Ok(socket),
                Err(message) => Err(RelayError::Authentication(format!(
                    "gateway refused connection: {message}"
                ))),
            };
        }
    }
    Err(RelayError::Transport(
        "gateway closed the connection during handshake".into(),
    ))
}

pub struct GatewayBackend {
    conversation_id: String,
    config: Arc<RelayConfig>,
    events: EventEmitter,
    session_key: String,
    turn: Arc<StdMutex<Option<String>>>,
    connection: OnceCell<Connection>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl GatewayBackend {
    pub fn new(ctx: BackendContext) -> Self {
        let session_key = ctx
            .session_key
            .unwrap_or_else(|| format!("agent-relay:{}", ctx.conversation_id));
        Self {
            conversation_id: ctx.conversation_id,
            config: ctx.config,
            events: ctx.events,
            session_key,
            turn: Arc::new(StdMutex::new(None)),
            connection: OnceCell::new(),
            child: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Make sure something is listening, spawning the gateway if needed.
    async fn ensure_running(&self) -> Result<()> {
        let gateway = &self.config.gateway;
        if gateway.use_external {
            return Ok(());
        }
        let address = gateway.address();
        if port_open(&address).await {
            tracing::info!(address, "Gateway already running");
            return Ok(());
        }

        let command = gateway.command.as_ref().ok_or_else(|| {
            RelayError::Bootstrap(format!(
                "no gateway listening on {address} and no gateway command configured"
            ))
        })?;
        let child = Command::new(command)
            .args(&gateway.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Bootstrap(format!("failed to spawn gateway {command}: {e}")))?;
        tracing::info!(command, pid = child.id(), "Spawned gateway");
        *self.child.lock().await = Some(child);

        let policy = RetryPolicy::port_probe();
        let probe = policy.execute(|| {
            let address = address.clone();
            async move {
                TcpStream::connect(&address)
                    .await
                    .map(|_| ())
                    .map_err(|e| RelayError::Transport(format!("gateway port not open yet: {e}")))
            }
        });
        with_timeout(self.config.connection_timeout(), probe)
            .await
            .map_err(|e| RelayError::Bootstrap(format!("gateway never opened {address}: {e}")))
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .get()
            .ok_or_else(|| RelayError::InvalidState("gateway not connected".into()))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.connection()?
            .request(method, params, self.config.connection_timeout())
            .await
    }
}

#[async_trait]
impl AgentBackend for GatewayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gateway
    }

    async fn start(&self) -> Result<()> {
        self.ensure_running().await?;

        let gateway = &self.config.gateway;
        let socket = with_timeout(
            self.config.connection_timeout(),
            open_socket(&gateway.url(), gateway.token.as_deref()),
        )
        .await?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(StdMutex::new(HashMap::new()));
        self.connection
            .set(Connection {
                outgoing,
                pending: pending.clone(),
            })
            .map_err(|_| RelayError::InvalidState("gateway already connected".into()))?;

        let runtime = Runtime {
            socket,
            outgoing: outgoing_rx,
            pending,
            events: self.events.clone(),
            turn: self.turn.clone(),
            session_key: self.session_key.clone(),
            ping_interval: Duration::from_millis(gateway.ping_interval_ms.max(1)),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(runtime.run());
        tracing::debug!(
            conversation_id = self.conversation_id,
            session_key = self.session_key,
            "Gateway connected"
        );
        Ok(())
    }

    async fn send(&self, request: SendRequest) -> Result<()> {
        *lock(&self.turn) = Some(request.turn_id.clone());

        let mut message = request.text.clone();
        for file in &request.files {
            message.push_str(&format!("\n@{}", file.display()));
        }
        let idempotency_key = if request.is_retry {
            format!("{}-{}", request.turn_id, uuid::Uuid::new_v4().simple())
        } else {
            request.turn_id.clone()
        };

        self.request(
            "chat.send",
            json!({
                "sessionKey": self.session_key,
                "message": message,
                "idempotencyKey": idempotency_key,
            }),
        )
        .await?;
        Ok(())
    }

    async fn confirm(&self, call_id: &str, option_id: &str) -> Result<()> {
        self.request(
            "exec.approval.resolve",
            json!({ "id": call_id, "decision": option_id }),
        )
        .await?;
        Ok(())
    }

    async fn reject(&self, call_id: &str) -> Result<()> {
        self.confirm(call_id, "deny").await
    }

    async fn stop(&self) -> Result<()> {
        self.request("chat.abort", json!({ "sessionKey": self.session_key }))
            .await?;
        Ok(())
    }

    fn session_key(&self) -> Option<String> {
        Some(self.session_key.clone())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Gateway process already gone");
            }
        }
        Ok(())
    }
}
