//! Agent CLI spoken to over line-delimited JSON-RPC on stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use super::rpc::{
    parse_permission_request, parse_session_update, permission_outcome, prompt_blocks, RpcError,
    RpcMessage, METHOD_NOT_FOUND,
};
use super::{AgentBackend, BackendContext, EventEmitter, RpcEvent, SendRequest, StreamSignal};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::resilience::{classify_error, with_timeout};
use crate::types::BackendKind;

const PROTOCOL_VERSION: u64 = 1;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Responder = oneshot::Sender<std::result::Result<Value, RpcError>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outgoing half of the connection plus requests awaiting a response.
struct Peer {
    tx: mpsc::UnboundedSender<String>,
    pending: StdMutex<HashMap<u64, Responder>>,
    next_id: AtomicU64,
}

impl Peer {
    fn spawn(writer: BoxWriter, cancel: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut writer = writer;
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                tracing::trace!(line = line.trim_end(), "RPC TX");
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(error = %e, "Failed to write to agent process");
                    break;
                }
            }
        });

        Arc::new(Self {
            tx,
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn write(&self, message: RpcMessage) -> Result<()> {
        self.tx
            .send(message.to_line())
            .map_err(|_| RelayError::Transport("agent process stdin closed".into()))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.write(RpcMessage::request(id, method, params)) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(RelayError::Transport(format!(
                "connection reset before {method} completed"
            ))),
        }
    }

    fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write(RpcMessage::notification(method, params))
    }

    fn respond(&self, id: Value, result: std::result::Result<Value, RpcError>) -> Result<()> {
        self.write(RpcMessage::Response { id, result })
    }

    fn resolve(&self, id: &Value, result: std::result::Result<Value, RpcError>) {
        let responder = id.as_u64().and_then(|id| lock(&self.pending).remove(&id));
        match responder {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => tracing::debug!(%id, "Response for unknown request"),
        }
    }

    /// Drop every waiter; their requests fail as transport errors.
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }
}

/// State the reader task shares with the backend.
#[derive(Clone)]
struct Inbound {
    events: EventEmitter,
    peer: Arc<Peer>,
    turn: Arc<StdMutex<Option<String>>>,
    permissions: Arc<StdMutex<HashMap<String, Value>>>,
}

impl Inbound {
    fn emit(&self, raw: impl Into<super::RawEvent>) {
        let turn = lock(&self.turn).clone();
        self.events.emit(turn.as_deref(), raw);
    }

    fn handle(&self, line: &str) {
        tracing::trace!(line, "RPC RX");
        let message = match RpcMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparseable line from agent process");
                return;
            }
        };

        match message {
            RpcMessage::Response { id, result } => self.peer.resolve(&id, result),
            RpcMessage::Notification { method, params } if method == "session/update" => {
                if let Some(event) = parse_session_update(&params) {
                    self.emit(event);
                }
            }
            RpcMessage::Notification { method, .. } => {
                tracing::debug!(method, "Ignoring notification");
            }
            RpcMessage::Request { id, method, params } if method == "session/request_permission" => {
                match parse_permission_request(&id, &params) {
                    Some(prompt) => {
                        lock(&self.permissions).insert(prompt.call_id.clone(), id);
                        self.emit(RpcEvent::PermissionRequest(prompt));
                    }
                    None => self.reject(id, "malformed permission request"),
                }
            }
            RpcMessage::Request { id, method, .. } => {
                tracing::debug!(method, "Rejecting unsupported client method");
                self.reject(id, &format!("method not found: {method}"));
            }
        }
    }

    fn reject(&self, id: Value, message: &str) {
        let error = RpcError {
            code: METHOD_NOT_FOUND,
            message: message.to_string(),
            data: None,
        };
        if let Err(e) = self.peer.respond(id, Err(error)) {
            tracing::debug!(error = %e, "Could not answer agent request");
        }
    }
}

/// Backend driving an agent CLI as a child process.
pub struct JsonRpcBackend {
    conversation_id: String,
    config: Arc<RelayConfig>,
    events: EventEmitter,
    resume_key: Option<String>,
    transport: StdMutex<Option<(BoxReader, BoxWriter)>>,
    peer: OnceCell<Arc<Peer>>,
    session_id: StdMutex<Option<String>>,
    turn: Arc<StdMutex<Option<String>>>,
    permissions: Arc<StdMutex<HashMap<String, Value>>>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl JsonRpcBackend {
    /// Backend that spawns `config.cli_path` on start.
    pub fn new(ctx: BackendContext) -> Result<Self> {
        if ctx.config.cli_path.is_none() {
            return Err(RelayError::Configuration(
                "jsonrpc backend requires cli_path (AGENT_RELAY_CLI_PATH)".into(),
            ));
        }
        Ok(Self::build(ctx, None))
    }

    /// Backend over an already-connected stream pair.
    pub fn with_transport<R, W>(ctx: BackendContext, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(ctx, Some((Box::new(reader), Box::new(writer))))
    }

    fn build(ctx: BackendContext, transport: Option<(BoxReader, BoxWriter)>) -> Self {
        Self {
            conversation_id: ctx.conversation_id,
            config: ctx.config,
            events: ctx.events,
            resume_key: ctx.session_key,
            transport: StdMutex::new(transport),
            peer: OnceCell::new(),
            session_id: StdMutex::new(None),
            turn: Arc::new(StdMutex::new(None)),
            permissions: Arc::new(StdMutex::new(HashMap::new())),
            child: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    async fn spawn_process(&self) -> Result<(BoxReader, BoxWriter)> {
        let path = self
            .config
            .cli_path
            .as_ref()
            .ok_or_else(|| RelayError::Configuration("cli_path is not set".into()))?;

        let mut child = Command::new(path)
            .args(&self.config.cli_args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::Bootstrap(format!("failed to spawn {}: {e}", path.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Bootstrap("agent process has no stdout".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Bootstrap("agent process has no stdin".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let conversation_id = self.conversation_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(conversation_id, line, "agent stderr");
                }
            });
        }

        tracing::info!(
            conversation_id = self.conversation_id,
            command = %path.display(),
            pid = child.id(),
            "Spawned agent process"
        );
        *self.child.lock().await = Some(child);
        Ok((Box::new(stdout), Box::new(stdin)))
    }

    fn spawn_reader(&self, reader: BoxReader, inbound: Inbound) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let reason = loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => inbound.handle(&line),
                    Ok(None) => break "agent process exited".to_string(),
                    Err(e) => break format!("connection reset reading agent output: {e}"),
                }
            };

            inbound.peer.fail_pending();
            if !cancel.is_cancelled() {
                tracing::warn!(reason, "Agent connection lost");
                inbound.emit(StreamSignal::ConnectionLost { message: reason });
            }
        });
    }

    async fn handshake(&self, peer: &Peer) -> Result<String> {
        peer.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {
                    "fs": { "readTextFile": false, "writeTextFile": false }
                }
            }),
        )
        .await?;

        let cwd = self.config.working_dir.display().to_string();
        if let Some(key) = &self.resume_key {
            let loaded = peer
                .request(
                    "session/load",
                    json!({ "sessionId": key, "cwd": cwd, "mcpServers": [] }),
                )
                .await;
            match loaded {
                Ok(_) => {
                    tracing::info!(session_id = key, "Resumed agent session");
                    return Ok(key.clone());
                }
                Err(e) => {
                    tracing::warn!(session_id = key, error = %e, "Session resume failed, starting fresh")
                }
            }
        }

        let created = peer
            .request("session/new", json!({ "cwd": cwd, "mcpServers": [] }))
            .await?;
        created
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Protocol("session/new returned no sessionId".into()))
    }

    fn peer(&self) -> Result<Arc<Peer>> {
        self.peer
            .get()
            .cloned()
            .ok_or_else(|| RelayError::InvalidState("agent process not started".into()))
    }

    fn session(&self) -> Result<String> {
        lock(&self.session_id)
            .clone()
            .ok_or_else(|| RelayError::InvalidState("no agent session".into()))
    }
}

#[async_trait]
impl AgentBackend for JsonRpcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Jsonrpc
    }

    async fn start(&self) -> Result<()> {
        let taken = lock(&self.transport).take();
        let (reader, writer) = match taken {
            Some(transport) => transport,
            None => self.spawn_process().await?,
        };

        let peer = Peer::spawn(writer, self.cancel.clone());
        self.peer
            .set(peer.clone())
            .map_err(|_| RelayError::InvalidState("agent process already started".into()))?;
        self.spawn_reader(
            reader,
            Inbound {
                events: self.events.clone(),
                peer: peer.clone(),
                turn: self.turn.clone(),
                permissions: self.permissions.clone(),
            },
        );

        let session_id = with_timeout(self.config.connection_timeout(), self.handshake(&peer)).await?;
        tracing::debug!(conversation_id = self.conversation_id, session_id, "Agent session ready");
        *lock(&self.session_id) = Some(session_id);
        Ok(())
    }

    async fn send(&self, request: SendRequest) -> Result<()> {
        let peer = self.peer()?;
        let session_id = self.session()?;
        *lock(&self.turn) = Some(request.turn_id.clone());

        let params = json!({
            "sessionId": session_id,
            "prompt": prompt_blocks(&request.text, &request.files),
        });
        let events = self.events.clone();
        let turn_id = request.turn_id;
        tokio::spawn(async move {
            match peer.request("session/prompt", params).await {
                Ok(result) => {
                    let stop_reason = result
                        .get("stopReason")
                        .and_then(Value::as_str)
                        .unwrap_or("end_turn")
                        .to_string();
                    events.emit(Some(&turn_id), RpcEvent::PromptFinished { stop_reason });
                }
                Err(e) => events.emit(Some(&turn_id), classify_error(&e)),
            }
        });
        Ok(())
    }

    async fn confirm(&self, call_id: &str, option_id: &str) -> Result<()> {
        let request_id = lock(&self.permissions).remove(call_id);
        match request_id {
            Some(id) => self.peer()?.respond(id, Ok(permission_outcome(Some(option_id)))),
            None => {
                tracing::debug!(call_id, "No permission request waiting");
                Ok(())
            }
        }
    }

    async fn reject(&self, call_id: &str) -> Result<()> {
        let request_id = lock(&self.permissions).remove(call_id);
        match request_id {
            Some(id) => self.peer()?.respond(id, Ok(permission_outcome(None))),
            None => Ok(()),
        }
    }

    async fn stop(&self) -> Result<()> {
        let peer = self.peer()?;
        if let Ok(session_id) = self.session() {
            peer.notify("session/cancel", json!({ "sessionId": session_id }))?;
        }
        let waiting: Vec<Value> = lock(&self.permissions).drain().map(|(_, id)| id).collect();
        for id in waiting {
            peer.respond(id, Ok(permission_outcome(None)))?;
        }
        Ok(())
    }

    fn session_key(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(peer) = self.peer.get() {
            peer.fail_pending();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Agent process already gone");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawEvent;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct FakeAgent {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl FakeAgent {
        async fn next(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.out.write_all(line.as_bytes()).await.unwrap();
        }

        async fn answer(&mut self, method: &str, result: Value) -> Value {
            let request = self.next().await;
            assert_eq!(request["method"], method);
            self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
                .await;
            request
        }
    }

    fn setup(session_key: Option<&str>) -> (
        JsonRpcBackend,
        FakeAgent,
        tokio::sync::mpsc::UnboundedReceiver<crate::backend::BackendEvent>,
    ) {
        let (client, agent) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (agent_read, agent_write) = tokio::io::split(agent);
        let (events, rx) = EventEmitter::channel();
        let ctx = BackendContext {
            conversation_id: "conv".into(),
            config: Arc::new(RelayConfig::default()),
            session_key: session_key.map(str::to_string),
            events,
        };
        let backend = JsonRpcBackend::with_transport(ctx, client_read, client_write);
        let agent = FakeAgent {
            lines: BufReader::new(agent_read).lines(),
            out: agent_write,
        };
        (backend, agent, rx)
    }

    #[tokio::test]
    async fn falls_back_to_new_session_when_resume_fails() {
        let (backend, mut agent, _rx) = setup(Some("old"));
        let agent_task = tokio::spawn(async move {
            agent.answer("initialize", json!({"protocolVersion": 1})).await;
            let load = agent.next().await;
            assert_eq!(load["method"], "session/load");
            agent
                .send(json!({"jsonrpc": "2.0", "id": load["id"], "error": {"code": -32002, "message": "unknown session"}}))
                .await;
            agent.answer("session/new", json!({"sessionId": "fresh"})).await;
            agent
        });

        backend.start().await.unwrap();
        agent_task.await.unwrap();
        assert_eq!(backend.session_key().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn prompt_streams_updates_and_permission_round_trip() {
        let (backend, mut agent, mut rx) = setup(None);
        let handshake = tokio::spawn(async move {
            agent.answer("initialize", json!({})).await;
            agent.answer("session/new", json!({"sessionId": "s1"})).await;
            agent
        });
        backend.start().await.unwrap();
        let mut agent = handshake.await.unwrap();

        backend
            .send(SendRequest {
                turn_id: "t1".into(),
                text: "hello".into(),
                files: vec![],
                is_retry: false,
            })
            .await
            .unwrap();

        let prompt = agent.next().await;
        assert_eq!(prompt["method"], "session/prompt");
        assert_eq!(prompt["params"]["prompt"][0]["text"], "hello");

        agent
            .send(json!({"jsonrpc": "2.0", "method": "session/update", "params": {
                "sessionId": "s1",
                "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hi"}}
            }}))
            .await;
        agent
            .send(json!({"jsonrpc": "2.0", "id": 99, "method": "session/request_permission", "params": {
                "sessionId": "s1",
                "toolCall": {"toolCallId": "call-1", "title": "Write file", "kind": "edit"},
                "options": [{"optionId": "allow", "name": "Allow", "kind": "allow_once"}]
            }}))
            .await;

        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.turn_id.as_deref(), Some("t1"));
        assert!(matches!(chunk.raw, RawEvent::Rpc(RpcEvent::AgentMessageChunk(_))));
        let permission = rx.recv().await.unwrap();
        assert!(matches!(permission.raw, RawEvent::Rpc(RpcEvent::PermissionRequest(_))));

        backend.confirm("call-1", "allow").await.unwrap();
        let reply = agent.next().await;
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["result"]["outcome"]["optionId"], "allow");

        agent
            .send(json!({"jsonrpc": "2.0", "id": prompt["id"], "result": {"stopReason": "end_turn"}}))
            .await;
        let finished = rx.recv().await.unwrap();
        assert_eq!(
            finished.raw,
            RawEvent::Rpc(RpcEvent::PromptFinished {
                stop_reason: "end_turn".into()
            })
        );
    }

    #[tokio::test]
    async fn closed_output_reports_connection_lost() {
        let (backend, mut agent, mut rx) = setup(None);
        let handshake = tokio::spawn(async move {
            agent.answer("initialize", json!({})).await;
            agent.answer("session/new", json!({"sessionId": "s1"})).await;
            agent
        });
        backend.start().await.unwrap();
        drop(handshake.await.unwrap());

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.raw,
            RawEvent::Signal(StreamSignal::ConnectionLost { .. })
        ));
    }

    #[test]
    fn spawning_requires_cli_path() {
        let (events, _rx) = EventEmitter::channel();
        let ctx = BackendContext {
            conversation_id: "conv".into(),
            config: Arc::new(RelayConfig::default()),
            session_key: None,
            events,
        };
        assert!(matches!(
            JsonRpcBackend::new(ctx),
            Err(RelayError::Configuration(_))
        ));
    }
}
