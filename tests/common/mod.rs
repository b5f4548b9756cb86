//! Shared test helpers: a scripted backend and a wired-up manager.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use agent_relay::backend::{
    AgentBackend, BackendContext, BackendFactory, ConfirmationPrompt, EventEmitter, RawEvent,
    SdkEvent, SendRequest, TextChunk,
};
use agent_relay::config::RelayConfig;
use agent_relay::error::{RelayError, Result};
use agent_relay::manager::{AgentManager, BroadcastBus, Collaborators, MemoryStore};
use agent_relay::types::{BackendKind, EventEnvelope, ToolCall, ToolKind, WireType};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("stub lock poisoned")
}

/// Everything the stub backend saw, plus what it will say next.
#[derive(Default)]
pub struct StubState {
    /// One batch of events per send, emitted in order.
    script: Mutex<VecDeque<Vec<RawEvent>>>,
    start_failures: Mutex<u32>,
    emitter: Mutex<Option<EventEmitter>>,
    turn: Mutex<Option<String>>,
    starts: Mutex<u32>,
    stops: Mutex<u32>,
    sends: Mutex<Vec<(SendRequest, Instant)>>,
    confirms: Mutex<Vec<(String, String)>>,
    history: Mutex<Vec<String>>,
}

impl StubState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the events answering the next send.
    pub fn script(&self, events: Vec<RawEvent>) {
        lock(&self.script).push_back(events);
    }

    pub fn fail_starts(&self, count: u32) {
        *lock(&self.start_failures) = count;
    }

    /// Emit an event tagged with the current turn.
    pub fn emit(&self, raw: RawEvent) {
        let turn = lock(&self.turn).clone();
        if let Some(emitter) = lock(&self.emitter).as_ref() {
            emitter.emit(turn.as_deref(), raw);
        }
    }

    pub fn starts(&self) -> u32 {
        *lock(&self.starts)
    }

    pub fn stops(&self) -> u32 {
        *lock(&self.stops)
    }

    pub fn sends(&self) -> Vec<(SendRequest, Instant)> {
        lock(&self.sends).clone()
    }

    pub fn confirms(&self) -> Vec<(String, String)> {
        lock(&self.confirms).clone()
    }

    pub fn history(&self) -> Vec<String> {
        lock(&self.history).clone()
    }
}

struct StubBackend {
    state: Arc<StubState>,
}

#[async_trait]
impl AgentBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sdk
    }

    async fn start(&self) -> Result<()> {
        *lock(&self.state.starts) += 1;
        let mut failures = lock(&self.state.start_failures);
        if *failures > 0 {
            *failures -= 1;
            return Err(RelayError::Transport("stub refused to start".into()));
        }
        Ok(())
    }

    async fn send(&self, request: SendRequest) -> Result<()> {
        *lock(&self.state.turn) = Some(request.turn_id.clone());
        lock(&self.state.sends).push((request, Instant::now()));
        let batch = lock(&self.state.script).pop_front().unwrap_or_default();
        for raw in batch {
            self.state.emit(raw);
        }
        Ok(())
    }

    async fn confirm(&self, call_id: &str, option_id: &str) -> Result<()> {
        lock(&self.state.confirms).push((call_id.to_string(), option_id.to_string()));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *lock(&self.state.stops) += 1;
        Ok(())
    }

    async fn record_history(&self, text: &str) -> Result<()> {
        lock(&self.state.history).push(text.to_string());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub fn factory(state: Arc<StubState>) -> Arc<dyn BackendFactory> {
    Arc::new(move |ctx: BackendContext| -> Result<Arc<dyn AgentBackend>> {
        *lock(&state.emitter) = Some(ctx.events);
        Ok(Arc::new(StubBackend {
            state: state.clone(),
        }))
    })
}

/// A manager wired to a stub backend, an in-memory store and a bus.
pub struct Harness {
    pub manager: AgentManager,
    pub events: broadcast::Receiver<EventEnvelope>,
    pub store: Arc<MemoryStore>,
    pub state: Arc<StubState>,
}

pub fn harness(conversation_id: &str, config: RelayConfig) -> Harness {
    let state = StubState::new();
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(BroadcastBus::default());
    let events = bus.subscribe();
    let deps = Collaborators::new(store.clone(), bus, factory(state.clone()));
    Harness {
        manager: AgentManager::new(conversation_id, Arc::new(config), deps),
        events,
        store,
        state,
    }
}

/// Skip envelopes until one of `kind` arrives.
pub async fn next_of(
    events: &mut broadcast::Receiver<EventEnvelope>,
    kind: WireType,
) -> EventEnvelope {
    loop {
        match events.recv().await {
            Ok(envelope) if envelope.kind == kind => return envelope,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("bus closed while waiting for {kind}"),
        }
    }
}

/// Every envelope up to and including the next `finish`.
pub async fn until_finish(events: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut seen = Vec::new();
    loop {
        match events.recv().await {
            Ok(envelope) => {
                let done = envelope.kind == WireType::Finish;
                seen.push(envelope);
                if done {
                    return seen;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("bus closed before finish"),
        }
    }
}

pub fn kinds(envelopes: &[EventEnvelope]) -> Vec<WireType> {
    envelopes.iter().map(|e| e.kind).collect()
}

pub fn text(chunk: &str) -> RawEvent {
    SdkEvent::Content(TextChunk::incremental(chunk)).into()
}

pub fn finished() -> RawEvent {
    SdkEvent::Finished {
        reason: Some("stop".into()),
    }
    .into()
}

pub fn invalid_stream() -> RawEvent {
    SdkEvent::InvalidStream {
        reason: "empty response".into(),
    }
    .into()
}

pub fn tool_request(call_id: &str, name: &str, args: Value) -> RawEvent {
    SdkEvent::ToolCallRequest(ToolCall::new(call_id, name, args)).into()
}

/// A shell-command permission prompt with the default options.
pub fn exec_prompt(call_id: &str, command: &str) -> RawEvent {
    SdkEvent::ToolCallConfirmation(ConfirmationPrompt {
        id: None,
        call_id: call_id.to_string(),
        tool_name: "run_shell_command".to_string(),
        title: format!("Run `{command}`"),
        description: String::new(),
        kind: Some(ToolKind::Execute),
        command: Some(command.to_string()),
        server: None,
        options: Vec::new(),
    })
    .into()
}
