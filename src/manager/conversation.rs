//! Per-conversation orchestrator.
//!
//! [`AgentManager`] is the public handle. The first send bootstraps the
//! backend and spawns a conversation actor that owns all mutable state:
//! normalizer, approval store, pending confirmations, tool tracker, stream
//! monitor and retry counter. Handles talk to the actor over a command
//! channel; the backend talks to it over its event channel.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::side_effects::{parse_schedule_commands, SideEffectHandler};
use super::sink::{EventBus, MessageStore};
use super::status::{AgentSnapshot, StatusPublisher};
use crate::approval::{
    approval_keys, decide, ApprovalDecision, ApprovalStore, PendingConfirmations, ToolTracker,
    Upsert,
};
use crate::backend::{
    AgentBackend, BackendContext, BackendEvent, BackendFactory, EventEmitter, RawEvent, SdkEvent,
    SendRequest, StreamSignal,
};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::normalize::Normalizer;
use crate::resilience::{with_timeout, InvalidStreamRetry, RetryDecision, StreamMonitor};
use crate::types::{
    CanonicalEvent, Confirmation, ConnectionState, ConversationStatus, EventEnvelope,
    MessageBody, MessageStatus, OptionKind, RemovalReason, Role, SessionMode, StoredMessage,
    ToolCallStatus, WireType,
};

/// Collaborators shared by every conversation.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub bus: Arc<dyn EventBus>,
    pub factory: Arc<dyn BackendFactory>,
    pub side_effects: Option<Arc<dyn SideEffectHandler>>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn EventBus>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            store,
            bus,
            factory,
            side_effects: None,
        }
    }

    pub fn with_side_effects(mut self, handler: Arc<dyn SideEffectHandler>) -> Self {
        self.side_effects = Some(handler);
        self
    }
}

enum Command {
    Send {
        text: String,
        files: Vec<PathBuf>,
        reply: oneshot::Sender<Result<String>>,
    },
    Confirm {
        call_id: String,
        option_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Cleanup {
        reply: oneshot::Sender<Vec<String>>,
    },
    SetMode {
        mode: SessionMode,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Messages the actor sends itself from timers.
enum Internal {
    Expired { call_id: String, id: String },
    Retry { turn_id: String },
}

/// Dropping the handle closes the command channel; the actor then shuts the backend down.
struct ActorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

/// Public handle to one conversation.
pub struct AgentManager {
    conversation_id: String,
    config: Arc<RelayConfig>,
    deps: Collaborators,
    force_mode: Option<SessionMode>,
    actor: OnceCell<ActorHandle>,
    status: Arc<StatusPublisher>,
    status_rx: watch::Receiver<AgentSnapshot>,
}

impl AgentManager {
    pub fn new(
        conversation_id: impl Into<String>,
        config: Arc<RelayConfig>,
        deps: Collaborators,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let (status, status_rx) = StatusPublisher::new(AgentSnapshot::new(
            conversation_id.clone(),
            config.backend,
            config.default_session_mode(),
        ));
        Self {
            conversation_id,
            config,
            deps,
            force_mode: None,
            actor: OnceCell::new(),
            status: Arc::new(status),
            status_rx,
        }
    }

    /// Override whatever mode the store has persisted.
    pub fn force_session_mode(mut self, mode: SessionMode) -> Self {
        self.force_mode = Some(mode);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.status.current()
    }

    pub fn watch(&self) -> watch::Receiver<AgentSnapshot> {
        self.status_rx.clone()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.actor.initialized()
    }

    /// Send a user message. Returns the message id of the reply turn.
    ///
    /// Bootstraps the backend on first use; concurrent first sends wait on
    /// the same bootstrap.
    pub async fn send(&self, text: impl Into<String>, files: Vec<PathBuf>) -> Result<String> {
        let actor = self.actor().await?;
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            actor,
            Command::Send {
                text: text.into(),
                files,
                reply,
            },
        )?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Answer a pending confirmation. `Ok(false)` when nothing is pending for `call_id`.
    pub async fn confirm(&self, call_id: &str, option_id: &str) -> Result<bool> {
        let Some(actor) = self.actor.get() else {
            return Ok(false);
        };
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            actor,
            Command::Confirm {
                call_id: call_id.to_string(),
                option_id: option_id.to_string(),
                reply,
            },
        )?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Cancel the turn in flight. Persisted state is kept.
    pub async fn stop(&self) -> Result<()> {
        let Some(actor) = self.actor.get() else {
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        self.dispatch(actor, Command::Stop { reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Cancel every unprotected, unfinished tool call. Returns their ids.
    pub async fn cleanup(&self) -> Vec<String> {
        let Some(actor) = self.actor.get() else {
            return Vec::new();
        };
        let (reply, rx) = oneshot::channel();
        if self.dispatch(actor, Command::Cleanup { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn set_session_mode(&self, mode: SessionMode) -> Result<()> {
        self.deps
            .store
            .save_session_mode(&self.conversation_id, mode)
            .await?;
        self.status.update(|s| s.session_mode = mode);
        if let Some(actor) = self.actor.get() {
            self.dispatch(actor, Command::SetMode { mode })?;
        }
        Ok(())
    }

    /// Stop the actor and release the backend.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(actor) = self.actor.get() else {
            return Ok(());
        };
        let (reply, rx) = oneshot::channel();
        if self.dispatch(actor, Command::Shutdown { reply }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn dispatch(&self, actor: &ActorHandle, command: Command) -> Result<()> {
        actor.commands.send(command).map_err(|_| actor_gone())
    }

    async fn actor(&self) -> Result<&ActorHandle> {
        self.actor.get_or_try_init(|| self.bootstrap()).await
    }

    async fn bootstrap(&self) -> Result<ActorHandle> {
        match self.try_bootstrap().await {
            Ok(actor) => Ok(actor),
            Err(e) => {
                let error = match e {
                    RelayError::Bootstrap(_) => e,
                    other => RelayError::Bootstrap(other.to_string()),
                };
                tracing::error!(
                    conversation_id = self.conversation_id,
                    error = %error,
                    "Backend bootstrap failed"
                );
                self.report_bootstrap_failure(&error).await;
                Err(error)
            }
        }
    }

    async fn try_bootstrap(&self) -> Result<ActorHandle> {
        let store = &self.deps.store;
        let persisted = store
            .load_session_mode(&self.conversation_id)
            .await?
            .unwrap_or_else(|| self.config.default_session_mode());
        let mode = SessionMode::effective(persisted, self.force_mode);
        let session_key = store.load_session_key(&self.conversation_id).await?;

        let (events, events_rx) = EventEmitter::channel();
        let backend = self.deps.factory.build(BackendContext {
            conversation_id: self.conversation_id.clone(),
            config: self.config.clone(),
            session_key,
            events,
        })?;

        if let Err(e) = with_timeout(self.config.connection_timeout(), backend.start()).await {
            if let Err(shutdown) = backend.shutdown().await {
                tracing::debug!(error = %shutdown, "Backend shutdown after failed start");
            }
            return Err(e);
        }

        if let Some(key) = backend.session_key() {
            if let Err(e) = store.save_session_key(&self.conversation_id, &key).await {
                tracing::warn!(conversation_id = self.conversation_id, error = %e, "Failed to persist session key");
            }
        }

        self.status.update(|s| {
            s.connection = ConnectionState::Connected;
            s.session_mode = mode;
            s.last_error = None;
        });
        tracing::info!(
            conversation_id = self.conversation_id,
            backend = %backend.kind(),
            mode = %mode,
            "Backend started"
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let conversation = Conversation {
            id: self.conversation_id.clone(),
            config: self.config.clone(),
            backend,
            deps: self.deps.clone(),
            status: self.status.clone(),
            mode,
            normalizer: Normalizer::new(self.config.working_dir.clone()),
            approvals: ApprovalStore::new(),
            pending: PendingConfirmations::new(),
            tracker: ToolTracker::new(),
            monitor: StreamMonitor::new(self.config.heartbeat_threshold()),
            retry: InvalidStreamRetry::new(
                self.config.invalid_stream_retries,
                self.config.invalid_stream_retry_delay(),
            ),
            internal,
            turn: None,
            last_msg_id: String::new(),
        };
        tokio::spawn(conversation.run(commands_rx, internal_rx, events_rx));
        Ok(ActorHandle { commands })
    }

    /// Persist a tip and emit `error` + `finish` so callers stop waiting.
    async fn report_bootstrap_failure(&self, error: &RelayError) {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let message = error.to_string();
        let tip = StoredMessage {
            status: MessageStatus::Error,
            ..StoredMessage::new(
                msg_id.clone(),
                self.conversation_id.clone(),
                Role::System,
                MessageBody::Tips {
                    content: message.clone(),
                    level: "error".into(),
                },
            )
        };
        if let Err(e) = self.deps.store.add_message(&self.conversation_id, tip).await {
            tracing::warn!(error = %e, "Failed to persist bootstrap error");
        }
        self.status.update(|s| {
            s.connection = ConnectionState::Failed;
            s.last_error = Some(message.clone());
        });
        let bus = &self.deps.bus;
        bus.emit(
            &self.conversation_id,
            EventEnvelope::new(WireType::Error, &self.conversation_id, &msg_id, json!(message)),
        );
        bus.emit(
            &self.conversation_id,
            EventEnvelope::new(WireType::Finish, &self.conversation_id, &msg_id, json!({})),
        );
    }
}

fn actor_gone() -> RelayError {
    RelayError::InvalidState("conversation is shut down".into())
}

/// The turn in flight.
struct Turn {
    request: SendRequest,
    msg_id: String,
    cancel: CancellationToken,
    started: bool,
    text: String,
}

/// Actor state. Only the actor task touches it.
struct Conversation {
    id: String,
    config: Arc<RelayConfig>,
    backend: Arc<dyn AgentBackend>,
    deps: Collaborators,
    status: Arc<StatusPublisher>,
    mode: SessionMode,
    normalizer: Normalizer,
    approvals: ApprovalStore,
    pending: PendingConfirmations,
    tracker: ToolTracker,
    monitor: StreamMonitor,
    retry: InvalidStreamRetry,
    internal: mpsc::UnboundedSender<Internal>,
    turn: Option<Turn>,
    last_msg_id: String,
}

impl Conversation {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        let period = self
            .config
            .heartbeat_check_interval()
            .max(std::time::Duration::from_millis(1));
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.on_command(command).await.is_break() {
                        return;
                    }
                }
                Some(message) = internal.recv() => self.on_internal(message).await,
                Some(event) = events.recv() => self.on_backend_event(event).await,
                _ = heartbeat.tick() => self.on_heartbeat().await,
            }
        }

        if let Err(e) = self.backend.shutdown().await {
            tracing::debug!(conversation_id = self.id, error = %e, "Backend shutdown failed");
        }
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Send { text, files, reply } => {
                let _ = reply.send(self.send(text, files).await);
            }
            Command::Confirm {
                call_id,
                option_id,
                reply,
            } => {
                let _ = reply.send(self.confirm(&call_id, &option_id).await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop().await);
            }
            Command::Cleanup { reply } => {
                let _ = reply.send(self.cleanup().await);
            }
            Command::SetMode { mode } => {
                tracing::debug!(conversation_id = self.id, %mode, "Session mode changed");
                self.mode = mode;
            }
            Command::Shutdown { reply } => {
                for confirmation in self.pending.drain() {
                    tracing::debug!(call_id = confirmation.call_id, "Dropping pending confirmation");
                }
                if let Some(turn) = &self.turn {
                    turn.cancel.cancel();
                }
                let _ = reply.send(self.backend.shutdown().await);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Expired { call_id, id } => self.expire(&call_id, &id).await,
            Internal::Retry { turn_id } => self.resend(&turn_id).await,
        }
    }

    // ---- caller operations ----

    async fn send(&mut self, text: String, files: Vec<PathBuf>) -> Result<String> {
        if self.turn.is_some() {
            return Err(RelayError::InvalidState(
                "a turn is already running for this conversation".into(),
            ));
        }

        let msg_id = uuid::Uuid::new_v4().to_string();
        let request = SendRequest {
            turn_id: uuid::Uuid::new_v4().to_string(),
            text,
            files,
            is_retry: false,
        };
        tracing::info!(
            conversation_id = self.id,
            turn_id = request.turn_id,
            msg_id,
            "Sending message"
        );

        self.retry.reset();
        self.normalizer.reset();
        self.tracker.reset();
        self.monitor.begin(Instant::now());

        let user = StoredMessage::new(
            uuid::Uuid::new_v4().to_string(),
            self.id.clone(),
            Role::User,
            MessageBody::Text {
                content: request.text.clone(),
            },
        );
        if let Err(e) = self.deps.store.add_message(&self.id, user).await {
            tracing::warn!(conversation_id = self.id, error = %e, "Failed to persist user message");
        }

        self.last_msg_id = msg_id.clone();
        self.turn = Some(Turn {
            request: request.clone(),
            msg_id: msg_id.clone(),
            cancel: CancellationToken::new(),
            started: false,
            text: String::new(),
        });
        self.status.update(|s| {
            s.current_msg_id = Some(msg_id.clone());
            s.last_error = None;
        });

        if let Err(e) = self.backend.send(request).await {
            tracing::warn!(conversation_id = self.id, error = %e, "Backend rejected send");
            self.on_error(e.to_string()).await;
            self.finish_turn().await;
            return Err(e);
        }
        Ok(msg_id)
    }

    async fn confirm(&mut self, call_id: &str, option_id: &str) -> Result<bool> {
        let Some(confirmation) = self.pending.get(call_id).cloned() else {
            tracing::debug!(conversation_id = self.id, call_id, "No pending confirmation");
            return Ok(false);
        };
        let option = confirmation.option(option_id).cloned().ok_or_else(|| {
            RelayError::InvalidState(format!("unknown option '{option_id}' for {call_id}"))
        })?;

        // Record before removal so a racing duplicate for the same key is covered.
        let always = option.kind == OptionKind::AllowAlways;
        if always {
            self.approvals.approve_all(&approval_keys(&confirmation));
        }
        self.pending.remove(call_id);

        let result = self.backend.confirm(call_id, option_id).await;
        if option.kind.allows() {
            self.tracker.protect(call_id);
        } else {
            self.cancel_tracked(call_id).await;
        }
        self.emit_removed(&confirmation, RemovalReason::Answered);

        if always {
            self.sweep_remembered().await;
        }
        self.sync_pending_count();
        result.map(|_| true)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(turn) = &self.turn else {
            return Ok(());
        };
        tracing::info!(conversation_id = self.id, turn_id = turn.request.turn_id, "Stopping turn");
        turn.cancel.cancel();
        let result = self.backend.stop().await;

        for confirmation in self.pending.drain() {
            self.cancel_tracked(&confirmation.call_id).await;
            self.emit_removed(&confirmation, RemovalReason::Canceled);
        }
        self.sync_pending_count();
        if !self.tracker.cleanup_pass().is_empty() {
            self.publish_tool_group().await;
        }
        self.finish_turn().await;
        result
    }

    async fn cleanup(&mut self) -> Vec<String> {
        let canceled = self.tracker.cleanup_pass();
        if !canceled.is_empty() {
            tracing::info!(conversation_id = self.id, ?canceled, "Cleanup canceled tool calls");
            self.publish_tool_group().await;
        }
        canceled
    }

    // ---- timers ----

    async fn expire(&mut self, call_id: &str, id: &str) {
        let Some(confirmation) = self.pending.remove_if_id(call_id, id) else {
            return;
        };
        let timeout = self.config.confirmation_timeout();
        tracing::warn!(
            conversation_id = self.id,
            call_id,
            timeout_ms = timeout.as_millis() as u64,
            "Confirmation expired, rejecting"
        );

        let delivered = match confirmation.reject_option() {
            Some(reject) => self.backend.confirm(call_id, &reject.value).await,
            None => {
                tracing::debug!(call_id, "Confirmation has no reject option, cancelling");
                self.backend.reject(call_id).await
            }
        };
        if let Err(e) = delivered {
            tracing::warn!(call_id, error = %e, "Failed to deliver expiry rejection");
        }
        self.cancel_tracked(call_id).await;
        self.emit_removed(&confirmation, RemovalReason::Expired);
        self.sync_pending_count();

        let error = RelayError::ConfirmationTimeout {
            call_id: call_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.on_error(format!("{} ({})", error, confirmation.title))
            .await;
    }

    async fn resend(&mut self, turn_id: &str) {
        let request = match &self.turn {
            Some(turn) if turn.request.turn_id == turn_id && !turn.cancel.is_cancelled() => {
                SendRequest {
                    is_retry: true,
                    ..turn.request.clone()
                }
            }
            _ => return,
        };
        tracing::info!(
            conversation_id = self.id,
            turn_id,
            attempt = self.retry.retries(),
            "Retrying after invalid stream"
        );
        self.normalizer.reset();
        if let Err(e) = self.backend.send(request).await {
            self.on_error(e.to_string()).await;
            self.finish_turn().await;
        }
    }

    async fn on_heartbeat(&mut self) {
        if self.turn.is_none() {
            return;
        }
        if let Some(elapsed) = self.monitor.check(Instant::now()) {
            tracing::warn!(
                conversation_id = self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Backend stream is silent"
            );
            let signal = StreamSignal::HeartbeatTimeout {
                elapsed_ms: elapsed.as_millis() as u64,
            };
            for event in self.normalizer.normalize(signal.into()).await {
                self.process(event).await;
            }
        }
    }

    // ---- backend events ----

    async fn on_backend_event(&mut self, event: BackendEvent) {
        let Some(turn) = &self.turn else {
            tracing::trace!(conversation_id = self.id, "Dropping event outside a turn");
            return;
        };
        if event
            .turn_id
            .as_deref()
            .is_some_and(|id| id != turn.request.turn_id)
        {
            tracing::debug!(conversation_id = self.id, "Dropping event from a stale turn");
            return;
        }

        if let Some(state) = self.monitor.record_event(Instant::now()) {
            self.process(CanonicalEvent::AgentStatus {
                state,
                message: None,
            })
            .await;
        }

        let terminal = match &event.raw {
            RawEvent::Sdk(SdkEvent::InvalidStream { reason })
            | RawEvent::Signal(StreamSignal::InvalidStream { reason }) => {
                let reason = reason.clone();
                self.on_invalid_stream(&reason).await;
                return;
            }
            RawEvent::Signal(StreamSignal::ConnectionLost { .. })
            | RawEvent::Signal(StreamSignal::Error { .. }) => true,
            _ => false,
        };

        for canonical in self.normalizer.normalize(event.raw).await {
            self.process(canonical).await;
        }

        if terminal && self.turn.is_some() {
            self.monitor.fail();
            self.tracker.unprotect_all();
            self.finish_turn().await;
        }
    }

    async fn on_invalid_stream(&mut self, reason: &str) {
        let Some(turn) = &self.turn else {
            return;
        };
        let turn_id = turn.request.turn_id.clone();
        match self.retry.on_invalid_stream(turn.cancel.is_cancelled()) {
            RetryDecision::Retry { attempt, delay } => {
                tracing::warn!(conversation_id = self.id, attempt, reason, "Invalid stream, scheduling retry");
                let internal = self.internal.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    let _ = internal.send(Internal::Retry { turn_id });
                });
            }
            RetryDecision::Exhausted { attempts } => {
                tracing::error!(conversation_id = self.id, attempts, reason, "Invalid stream retries exhausted");
                self.on_error(format!(
                    "The model returned an invalid response after {attempts} attempts: {reason}"
                ))
                .await;
                self.finish_turn().await;
            }
            RetryDecision::Abandoned => {
                tracing::debug!(conversation_id = self.id, "Retry abandoned after cancel");
            }
        }
    }

    /// Apply one canonical event: state first, then persistence, then the bus.
    async fn process(&mut self, event: CanonicalEvent) {
        match event {
            CanonicalEvent::Start => self.ensure_started().await,
            CanonicalEvent::Finish => {
                if self.turn.is_some() {
                    self.finish_turn().await;
                }
            }
            CanonicalEvent::Error { message } => {
                self.ensure_started().await;
                self.on_error(message).await;
            }
            CanonicalEvent::AgentStatus { state, message } => {
                self.status.update(|s| s.connection = state);
                self.emit(
                    WireType::AgentStatus,
                    json!({ "state": state, "message": message }),
                );
            }
            CanonicalEvent::ConfirmationRemoved { call_id, id, reason } => {
                self.emit(
                    WireType::ConfirmationRemove,
                    json!({ "call_id": call_id, "id": id, "reason": reason }),
                );
            }
            body => {
                if self.turn.is_none() {
                    tracing::debug!(conversation_id = self.id, event = body.name(), "Dropping event after finish");
                    return;
                }
                self.ensure_started().await;
                self.on_body(body).await;
            }
        }
    }

    async fn on_body(&mut self, event: CanonicalEvent) {
        match event {
            CanonicalEvent::Content { text } => self.on_content(text).await,
            CanonicalEvent::Thought { subject, text } => self.on_thought(subject, text),
            CanonicalEvent::ToolCallRequest { call_id, name, args } => {
                self.tracker.request(&call_id, &name, args.clone());
                self.emit(
                    WireType::ToolCallRequest,
                    json!({ "call_id": call_id, "name": name, "args": args }),
                );
                self.publish_tool_group().await;
            }
            CanonicalEvent::ToolCallUpdate {
                call_id,
                name,
                status,
                kind,
                output,
            } => {
                self.tracker
                    .update(&call_id, name.as_deref(), status, kind, output);
                self.publish_tool_group().await;
            }
            CanonicalEvent::ConfirmationRequest { confirmation } => {
                self.on_confirmation(confirmation).await;
            }
            other => {
                tracing::debug!(event = other.name(), "Unexpected event in turn body");
            }
        }
    }

    async fn ensure_started(&mut self) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.started {
            return;
        }
        turn.started = true;
        self.status.update(|s| s.status = ConversationStatus::Running);
        self.emit(WireType::Start, json!({}));
    }

    async fn on_content(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.text.push_str(&text);
        let message = StoredMessage::new(
            turn.msg_id.clone(),
            self.id.clone(),
            Role::Assistant,
            MessageBody::Text {
                content: turn.text.clone(),
            },
        );
        if let Err(e) = self
            .deps
            .store
            .add_or_update_message(&self.id, message, "stream")
            .await
        {
            tracing::warn!(conversation_id = self.id, error = %e, "Failed to persist assistant text");
        }
        self.emit(WireType::Content, json!(text));
    }

    fn on_thought(&self, subject: Option<String>, text: String) {
        self.emit(WireType::Thought, json!({ "subject": subject, "text": text }));
    }

    async fn on_confirmation(&mut self, confirmation: Confirmation) {
        match decide(self.mode, &confirmation, &self.approvals) {
            ApprovalDecision::AutoApprove { option, reason } => {
                tracing::info!(
                    conversation_id = self.id,
                    call_id = confirmation.call_id,
                    option,
                    ?reason,
                    "Auto-approving confirmation"
                );
                match self.backend.confirm(&confirmation.call_id, &option).await {
                    Ok(()) => self.tracker.protect(&confirmation.call_id),
                    Err(e) => {
                        self.on_error(format!("Failed to auto-approve {}: {e}", confirmation.title))
                            .await
                    }
                }
            }
            ApprovalDecision::Ask => {
                let call_id = confirmation.call_id.clone();
                let id = confirmation.id.clone();
                let data = serde_json::to_value(&confirmation).unwrap_or(Value::Null);
                if self.pending.upsert(confirmation) == Upsert::Inserted {
                    let internal = self.internal.clone();
                    let timeout = self.config.confirmation_timeout();
                    let expiry_call_id = call_id.clone();
                    let timer = tokio::spawn(async move {
                        time::sleep(timeout).await;
                        let _ = internal.send(Internal::Expired {
                            call_id: expiry_call_id,
                            id,
                        });
                    });
                    self.pending.set_expiry(&call_id, timer);
                }
                self.sync_pending_count();
                self.emit(WireType::ConfirmationRequest, data);
            }
        }
    }

    /// Auto-approve every other pending confirmation now covered by the store.
    async fn sweep_remembered(&mut self) {
        let covered: Vec<Confirmation> = self
            .pending
            .confirmations()
            .filter(|c| self.approvals.all_approved(&approval_keys(c)))
            .cloned()
            .collect();
        for confirmation in covered {
            self.pending.remove(&confirmation.call_id);
            let Some(option) = confirmation.preferred_allow_option().cloned() else {
                continue;
            };
            match self.backend.confirm(&confirmation.call_id, &option.value).await {
                Ok(()) => self.tracker.protect(&confirmation.call_id),
                Err(e) => tracing::warn!(call_id = confirmation.call_id, error = %e, "Auto-approval failed"),
            }
            self.emit_removed(&confirmation, RemovalReason::AutoApproved);
        }
    }

    async fn on_error(&mut self, message: String) {
        self.tracker.unprotect_all();
        let tip = StoredMessage {
            status: MessageStatus::Error,
            ..StoredMessage::new(
                uuid::Uuid::new_v4().to_string(),
                self.id.clone(),
                Role::System,
                MessageBody::Tips {
                    content: message.clone(),
                    level: "error".into(),
                },
            )
        };
        if let Err(e) = self.deps.store.add_message(&self.id, tip).await {
            tracing::warn!(conversation_id = self.id, error = %e, "Failed to persist error tip");
        }
        self.status.update(|s| s.last_error = Some(message.clone()));
        self.emit(WireType::Error, json!(message));
    }

    async fn finish_turn(&mut self) {
        self.ensure_started().await;
        for event in self.normalizer.finish_turn() {
            match event {
                CanonicalEvent::Content { text } => self.on_content(text).await,
                CanonicalEvent::Thought { subject, text } => self.on_thought(subject, text),
                _ => {}
            }
        }

        let Some(turn) = self.turn.take() else {
            return;
        };
        turn.cancel.cancel();

        if let Some(handler) = &self.deps.side_effects {
            for command in parse_schedule_commands(&turn.text) {
                if let Err(e) = handler.on_schedule(&self.id, command).await {
                    tracing::warn!(conversation_id = self.id, error = %e, "Schedule command failed");
                }
            }
        }

        if self.tracker.batch_all_canceled() {
            let note = format!(
                "[The user canceled these tool calls before they ran: {}]",
                self.tracker.names().join(", ")
            );
            if let Err(e) = self.backend.record_history(&note).await {
                tracing::warn!(conversation_id = self.id, error = %e, "Failed to record cancellation");
            }
        }

        if self.monitor.state() != ConnectionState::Failed {
            self.monitor.close();
        }
        self.status.update(|s| s.status = ConversationStatus::Finished);
        tracing::info!(conversation_id = self.id, turn_id = turn.request.turn_id, "Turn finished");
        self.emit(WireType::Finish, json!({}));
    }

    // ---- helpers ----

    /// Mark a tracked call canceled; untracked ids (approval-only prompts) are ignored.
    async fn cancel_tracked(&mut self, call_id: &str) {
        if self.tracker.status(call_id).is_none() {
            return;
        }
        self.tracker
            .update(call_id, None, ToolCallStatus::Canceled, None, None);
        self.publish_tool_group().await;
    }

    async fn publish_tool_group(&mut self) {
        let calls = self.tracker.snapshot();
        let data = serde_json::to_value(&calls).unwrap_or(Value::Null);
        let message = StoredMessage::new(
            format!("{}:tools", self.last_msg_id),
            self.id.clone(),
            Role::Assistant,
            MessageBody::ToolGroup { calls },
        );
        if let Err(e) = self
            .deps
            .store
            .add_or_update_message(&self.id, message, "tool_group")
            .await
        {
            tracing::warn!(conversation_id = self.id, error = %e, "Failed to persist tool group");
        }
        self.emit(WireType::ToolGroup, data);
    }

    fn emit_removed(&self, confirmation: &Confirmation, reason: RemovalReason) {
        self.emit(
            WireType::ConfirmationRemove,
            json!({ "call_id": confirmation.call_id, "id": confirmation.id, "reason": reason }),
        );
    }

    fn sync_pending_count(&self) {
        let count = self.pending.len();
        self.status.update(|s| s.pending_confirmations = count);
    }

    fn emit(&self, kind: WireType, data: Value) {
        let msg_id = self
            .turn
            .as_ref()
            .map(|turn| turn.msg_id.as_str())
            .unwrap_or(self.last_msg_id.as_str());
        tracing::trace!(conversation_id = self.id, %kind, "Forwarding event");
        self.deps
            .bus
            .emit(&self.id, EventEnvelope::new(kind, &self.id, msg_id, data));
    }
}
