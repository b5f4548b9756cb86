#![cfg(feature = "gateway")]

//! The gateway backend against an in-process WebSocket server.

mod common;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use agent_relay::backend::{sdk::NoTools, ConfiguredFactory};
use agent_relay::config::{GatewayConfig, RelayConfig};
use agent_relay::error::RelayError;
use agent_relay::manager::{AgentManager, BroadcastBus, Collaborators, MemoryStore};
use agent_relay::types::{BackendKind, WireType};

use common::until_finish;

/// Accept one client, answer its requests and stream a reply to `chat.send`.
/// Resolves to every request frame received.
async fn fake_gateway(accept_connect: bool) -> (u16, JoinHandle<Vec<Value>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let port = listener.local_addr().expect("local addr").port();

    let server = tokio::spawn(async move {
        // Port probes connect and hang up without a handshake.
        let mut ws = loop {
            let (stream, _) = listener.accept().await.expect("server should accept");
            if let Ok(ws) = accept_async(stream).await {
                break ws;
            }
        };
        let mut requests = Vec::new();

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(&text).expect("json frame");
            requests.push(frame.clone());
            let id = frame["id"].clone();
            let method = frame["method"].as_str().unwrap_or_default().to_string();

            let reply = if method == "connect" && !accept_connect {
                json!({ "type": "res", "id": id, "ok": false, "error": { "message": "bad token" } })
            } else {
                json!({ "type": "res", "id": id, "ok": true, "payload": {} })
            };
            ws.send(Message::Text(reply.to_string())).await.expect("send res");

            if method == "chat.send" {
                let session_key = frame["params"]["sessionKey"].clone();
                for (state, message) in [("delta", "Hel"), ("delta", "Hello"), ("final", "Hello world")] {
                    let event = json!({
                        "type": "event",
                        "event": "chat",
                        "payload": { "sessionKey": session_key, "state": state, "message": message },
                    });
                    ws.send(Message::Text(event.to_string())).await.expect("send event");
                }
            }
        }
        requests
    });
    (port, server)
}

fn gateway_manager(port: u16) -> (AgentManager, Arc<BroadcastBus>) {
    let config = RelayConfig {
        backend: BackendKind::Gateway,
        gateway: GatewayConfig {
            port,
            // Never launched: something is already listening.
            command: Some("/nonexistent/agent-gateway".into()),
            ..GatewayConfig::default()
        },
        ..RelayConfig::default()
    };
    let bus = Arc::new(BroadcastBus::default());
    let deps = Collaborators::new(
        Arc::new(MemoryStore::new()),
        bus.clone(),
        Arc::new(ConfiguredFactory::new(Arc::new(NoTools))),
    );
    (AgentManager::new("conv-gw", Arc::new(config), deps), bus)
}

#[tokio::test]
async fn running_gateway_is_reused_and_streams_a_reply() {
    let (port, server) = fake_gateway(true).await;
    let (manager, bus) = gateway_manager(port);
    let mut events = bus.subscribe();

    manager.send("hi", Vec::new()).await.unwrap();
    let envelopes = until_finish(&mut events).await;
    let streamed: String = envelopes
        .iter()
        .filter(|e| e.kind == WireType::Content)
        .filter_map(|e| e.data.as_str())
        .collect();
    assert_eq!(streamed, "Hello world");

    manager.shutdown().await.unwrap();
    let requests = timeout(Duration::from_secs(5), server)
        .await
        .expect("server should see the close")
        .expect("server task");

    let methods: Vec<&str> = requests
        .iter()
        .filter_map(|r| r["method"].as_str())
        .collect();
    assert_eq!(methods, vec!["connect", "chat.send"]);
    let params = &requests[1]["params"];
    assert_eq!(params["sessionKey"], "agent-relay:conv-gw");
    assert_eq!(params["message"], "hi");
    assert!(params["idempotencyKey"].as_str().is_some_and(|k| !k.is_empty()));
}

#[tokio::test]
async fn refused_connect_fails_bootstrap() {
    let (port, _server) = fake_gateway(false).await;
    let (manager, bus) = gateway_manager(port);
    let mut events = bus.subscribe();

    let err = manager.send("hi", Vec::new()).await.unwrap_err();
    match err {
        RelayError::Bootstrap(message) => assert!(message.contains("bad token")),
        other => panic!("expected a bootstrap error, got {other:?}"),
    }
    let envelopes = until_finish(&mut events).await;
    assert_eq!(envelopes[0].kind, WireType::Error);
}
