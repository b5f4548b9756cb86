#![cfg(feature = "jsonrpc")]

//! A JSON-RPC agent over an in-memory pipe, driven through the manager.

mod common;

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};

use agent_relay::backend::jsonrpc::JsonRpcBackend;
use agent_relay::backend::{AgentBackend, BackendContext};
use agent_relay::config::RelayConfig;
use agent_relay::error::{RelayError, Result};
use agent_relay::manager::{
    AgentManager, BroadcastBus, Collaborators, MemoryStore, MessageStore,
};
use agent_relay::types::{BackendKind, WireType};

use common::{next_of, until_finish};

struct Agent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    out: WriteHalf<DuplexStream>,
}

impl Agent {
    async fn next(&mut self) -> Value {
        let line = self.lines.next_line().await.unwrap().expect("client hung up");
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.out.write_all(line.as_bytes()).await.unwrap();
    }

    async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
            .await;
    }

    async fn update(&mut self, update: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": "s1", "update": update },
        }))
        .await;
    }
}

/// Plays one turn: a shell tool that needs permission, then a short answer.
/// Hands the agent back so the pipe stays open until the caller is done.
async fn play_turn(mut agent: Agent) -> (Agent, Vec<Value>) {
    let mut seen = Vec::new();

    let initialize = agent.next().await;
    agent.reply(&initialize, json!({ "protocolVersion": 1 })).await;
    let new_session = agent.next().await;
    agent.reply(&new_session, json!({ "sessionId": "s1" })).await;

    let prompt = agent.next().await;
    agent
        .update(json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "call-1",
            "title": "Run tests",
            "kind": "execute",
            "status": "pending",
            "rawInput": { "command": "cargo test" },
        }))
        .await;
    agent
        .send(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "session/request_permission",
            "params": {
                "sessionId": "s1",
                "toolCall": {
                    "toolCallId": "call-1",
                    "title": "Run tests",
                    "kind": "execute",
                    "rawInput": { "command": "cargo test" },
                },
                "options": [
                    { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                    { "optionId": "reject", "name": "Reject", "kind": "reject_once" },
                ],
            },
        }))
        .await;

    let permission = agent.next().await;
    agent
        .update(json!({ "sessionUpdate": "tool_call_update", "toolCallId": "call-1", "status": "completed" }))
        .await;
    agent
        .update(json!({
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "text", "text": "All tests pass." },
        }))
        .await;
    agent.reply(&prompt, json!({ "stopReason": "end_turn" })).await;

    seen.extend([initialize, new_session, prompt, permission]);
    (agent, seen)
}

#[tokio::test]
async fn permission_round_trip_through_the_manager() {
    let (client, agent) = duplex(64 * 1024);
    let (agent_read, agent_write) = tokio::io::split(agent);
    let agent = tokio::spawn(play_turn(Agent {
        lines: BufReader::new(agent_read).lines(),
        out: agent_write,
    }));

    let transport = Mutex::new(Some(tokio::io::split(client)));
    let factory = move |ctx: BackendContext| -> Result<Arc<dyn AgentBackend>> {
        let (reader, writer) = transport
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RelayError::Bootstrap("transport already used".into()))?;
        Ok(Arc::new(JsonRpcBackend::with_transport(ctx, reader, writer)))
    };

    let config = RelayConfig {
        backend: BackendKind::Jsonrpc,
        ..RelayConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(BroadcastBus::default());
    let mut events = bus.subscribe();
    let deps = Collaborators::new(store.clone(), bus, Arc::new(factory));
    let manager = AgentManager::new("conv-rpc", Arc::new(config), deps);

    manager.send("run the tests", Vec::new()).await.unwrap();
    let request = next_of(&mut events, WireType::ConfirmationRequest).await;
    assert_eq!(request.data["call_id"], "call-1");
    assert_eq!(request.data["action"], "exec");
    assert_eq!(request.data["command_type"], "cargo");

    assert!(manager.confirm("call-1", "allow").await.unwrap());
    let rest = until_finish(&mut events).await;
    let streamed: String = rest
        .iter()
        .filter(|e| e.kind == WireType::Content)
        .filter_map(|e| e.data.as_str())
        .collect();
    assert_eq!(streamed, "All tests pass.");

    let (_agent, seen) = agent.await.unwrap();
    assert_eq!(seen[2]["params"]["prompt"][0]["text"], "run the tests");
    assert_eq!(seen[3]["id"], 7);
    assert_eq!(seen[3]["result"]["outcome"]["optionId"], "allow");
    assert_eq!(
        store.load_session_key("conv-rpc").await.unwrap().as_deref(),
        Some("s1")
    );
}
