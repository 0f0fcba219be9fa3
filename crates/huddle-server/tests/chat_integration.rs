//! End-to-end tests using real WebSocket clients against a live server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use huddle_server::{start, DuplicatePolicy, ServerConfig, ServerHandle};
use huddle_telemetry::MetricsRecorder;
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

async fn boot_server(policy: DuplicatePolicy) -> ServerHandle {
    boot_with(ServerConfig {
        duplicate_policy: policy,
        ..local_config()
    })
    .await
}

async fn boot_with(config: ServerConfig) -> ServerHandle {
    start(config, Arc::new(MetricsRecorder::new())).await.unwrap()
}

/// Poll until `check` holds or the test timeout elapses.
async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn connect(server: &ServerHandle, username: &str) -> WsStream {
    let url = format!("ws://{}/api/v1/chat/ws/{username}", server.local_addr());
    let (ws, _) = timeout(TIMEOUT, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

/// Read the next chat event, skipping control frames.
async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Read until a close frame arrives and return its code.
async fn next_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("read error");
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

fn users(event: &Value) -> Vec<String> {
    let mut names: Vec<String> = event["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    names.sort();
    names
}

async fn say(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

#[tokio::test]
async fn join_message_leave_flow() {
    let server = boot_server(DuplicatePolicy::Evict).await;

    let mut alice = connect(&server, "alice").await;
    let join = next_event(&mut alice).await;
    assert_eq!(join["type"], "join");
    assert_eq!(join["username"], "alice");
    assert_eq!(join["content"], "alice joined the chat");
    assert_eq!(users(&join), vec!["alice"]);

    let mut bob = connect(&server, "bob").await;
    for ws in [&mut alice, &mut bob] {
        let join = next_event(ws).await;
        assert_eq!(join["type"], "join");
        assert_eq!(join["username"], "bob");
        assert_eq!(users(&join), vec!["alice", "bob"]);
    }

    say(&mut alice, r#"{"content":"hi"}"#).await;
    for ws in [&mut alice, &mut bob] {
        let msg = next_event(ws).await;
        assert_eq!(msg["type"], "message");
        assert_eq!(msg["username"], "alice");
        assert_eq!(msg["content"], "hi");
        assert_eq!(users(&msg), vec!["alice", "bob"]);
        assert!(msg["timestamp"].is_string());
    }

    bob.close(None).await.unwrap();
    let leave = next_event(&mut alice).await;
    assert_eq!(leave["type"], "leave");
    assert_eq!(leave["username"], "bob");
    assert_eq!(leave["content"], "bob left the chat");
    assert_eq!(users(&leave), vec!["alice"]);

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_are_relayed_as_empty_content() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut alice = connect(&server, "alice").await;
    next_event(&mut alice).await;

    say(&mut alice, "definitely not json").await;
    let msg = next_event(&mut alice).await;
    assert_eq!(msg["type"], "message");
    assert_eq!(msg["content"], "");

    say(&mut alice, r#"{"text":"wrong field"}"#).await;
    assert_eq!(next_event(&mut alice).await["content"], "");

    say(&mut alice, r#"{"content":"still connected"}"#).await;
    assert_eq!(next_event(&mut alice).await["content"], "still connected");

    server.shutdown().await;
}

#[tokio::test]
async fn reconnect_under_same_name_evicts_previous_connection() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut observer = connect(&server, "carol").await;
    next_event(&mut observer).await;

    let mut first = connect(&server, "alice").await;
    next_event(&mut first).await;
    next_event(&mut observer).await;

    let mut second = connect(&server, "alice").await;
    assert_eq!(next_close_code(&mut first).await, 4000);

    let join = next_event(&mut second).await;
    assert_eq!(join["type"], "join");
    assert_eq!(users(&join), vec!["alice", "carol"]);
    assert_eq!(next_event(&mut observer).await["type"], "join");

    say(&mut observer, r#"{"content":"who is here"}"#).await;
    let msg = next_event(&mut second).await;
    assert_eq!(msg["content"], "who is here");
    // No leave for alice: the identity never left the room.
    let seen = next_event(&mut observer).await;
    assert_eq!(seen["type"], "message");
    assert_eq!(server.room().registry().len(), 2);

    server.shutdown().await;
}

#[tokio::test]
async fn reject_policy_closes_duplicate() {
    let server = boot_server(DuplicatePolicy::Reject).await;
    let mut first = connect(&server, "alice").await;
    next_event(&mut first).await;

    let mut second = connect(&server, "alice").await;
    assert_eq!(next_close_code(&mut second).await, 4001);

    say(&mut first, r#"{"content":"still mine"}"#).await;
    let msg = next_event(&mut first).await;
    assert_eq!(msg["type"], "message");
    assert_eq!(users(&msg), vec!["alice"]);

    server.shutdown().await;
}

#[tokio::test]
async fn abrupt_disconnect_announces_leave() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut alice = connect(&server, "alice").await;
    next_event(&mut alice).await;

    let bob = connect(&server, "bob").await;
    next_event(&mut alice).await;
    drop(bob);

    let leave = next_event(&mut alice).await;
    assert_eq!(leave["type"], "leave");
    assert_eq!(leave["username"], "bob");
    assert_eq!(users(&leave), vec!["alice"]);

    server.shutdown().await;
}

#[tokio::test]
async fn health_counts_live_connections() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut alice = connect(&server, "alice").await;
    next_event(&mut alice).await;

    let url = format!("http://{}/health", server.local_addr());
    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["metrics"]["counters"]["connections_opened"], 1);
    assert_eq!(body["metrics"]["gauges"]["connections_active"], 1);

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_clients_going_away() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut alice = connect(&server, "alice").await;
    next_event(&mut alice).await;

    server.shutdown().await;
    assert_eq!(next_close_code(&mut alice).await, 1001);
}

#[tokio::test]
async fn shutdown_does_not_count_delivery_failures() {
    let server = boot_server(DuplicatePolicy::Evict).await;
    let mut clients = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let mut ws = connect(&server, name).await;
        next_event(&mut ws).await;
        clients.push(ws);
    }
    let room = Arc::clone(server.room());
    assert_eq!(room.metrics().counter("broadcasts"), 4);

    server.shutdown().await;
    wait_until(|| room.registry().is_empty()).await;

    assert_eq!(room.metrics().counter("delivery_failures"), 0);
    assert_eq!(room.metrics().counter("broadcasts"), 4);
    for ws in &mut clients {
        assert_eq!(next_close_code(ws).await, 1001);
    }
}

#[tokio::test]
async fn silent_client_hits_idle_timeout() {
    let server = boot_with(ServerConfig {
        idle_timeout_secs: 1,
        heartbeat_interval_secs: 0,
        ..local_config()
    })
    .await;

    let mut alice = connect(&server, "alice").await;
    next_event(&mut alice).await;
    let mut bob = connect(&server, "bob").await;
    next_event(&mut bob).await;

    // Bob keeps talking so only alice goes quiet long enough.
    let mut leave = None;
    for _ in 0..25 {
        say(&mut bob, r#"{"content":"still here"}"#).await;
        let event = next_event(&mut bob).await;
        if event["type"] == "leave" {
            leave = Some(event);
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let leave = leave.expect("no leave before deadline");
    assert_eq!(leave["username"], "alice");
    assert_eq!(users(&leave), vec!["bob"]);

    assert_eq!(next_close_code(&mut alice).await, 1000);
    assert!(!server.room().registry().contains(&"alice".into()));

    server.shutdown().await;
}
