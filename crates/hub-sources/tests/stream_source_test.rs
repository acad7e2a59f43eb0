//! WebSocket and Socket.IO sources against in-process servers

use futures_util::{SinkExt, StreamExt};
use hub_config::MemoryKvStore;
use hub_core::Value;
use hub_event_bus::EventBus;
use hub_sources::proxy::{self, SocketIoTestRequest, WebSocketTestRequest};
use hub_sources::{Mapping, Source, SourceManager, SshAccess};
use hub_variables::VariableStore;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn setup() -> (SourceManager, Arc<VariableStore>) {
    let vars = VariableStore::new(Arc::new(EventBus::new()), Arc::new(MemoryKvStore::new()));
    (SourceManager::new(vars.clone(), SshAccess::none()), vars)
}

async fn wait_for(vars: &VariableStore, name: &str, expected: Value) -> bool {
    for _ in 0..150 {
        if vars.get(name).ok() == Some(expected.clone()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// WebSocket
// ============================================================================

/// Accepts connections and sends `frames` on each, then idles
async fn ws_server(frames: Vec<String>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                for f in frames {
                    if ws.send(Message::Text(f)).await.is_err() {
                        return;
                    }
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });
    (format!("ws://{}", addr), accepted)
}

#[tokio::test]
async fn test_websocket_frames_are_mapped() {
    let (uri, _) = ws_server(vec![
        "not json".into(),
        json!({"sensor": {"temp": 21}}).to_string(),
        json!({"sensor": {"temp": 22}}).to_string(),
    ])
    .await;

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "feed",
        "type": "websocket",
        "uri": uri,
        "mappings": [{"json_path": "sensor.temp", "var_name": "room_temp"}]
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.start_all();

    assert!(wait_for(&vars, "room_temp", Value::Int(22)).await);
    let snap = mgr.get_copy("feed").unwrap();
    assert!(snap.runtime.connected);
    assert_eq!(snap.runtime.dropped_non_json, 1);
    assert_eq!(snap.runtime.messages, 2);

    mgr.stop_all().await;
    assert!(!mgr.get_copy("feed").unwrap().runtime.connected);
}

#[tokio::test]
async fn test_websocket_reconnects_after_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut n = 0;
        while let Ok((stream, _)) = listener.accept().await {
            n += 1;
            let Ok(mut ws) = accept_async(stream).await else {
                continue;
            };
            let _ = ws.send(Message::Text(json!({"round": n}).to_string())).await;
            let _ = ws.close(None).await;
        }
    });

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "flaky",
        "type": "ws",
        "url": format!("ws://{}", addr),
        "reconnect_ms": 100,
        "mappings": [{"json_path": "round", "var_name": "flaky.round"}]
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.start_all();

    assert!(wait_for(&vars, "flaky.round", Value::Int(2)).await);
    assert!(mgr.get_copy("flaky").unwrap().runtime.reconnects >= 1);
    mgr.stop_all().await;
}

#[tokio::test]
async fn test_websocket_probe_returns_first_message() {
    let (uri, _) = ws_server(vec![json!({"a": {"b": 5}}).to_string()]).await;

    let req: WebSocketTestRequest = serde_json::from_value(json!({
        "uri": uri, "timeout_ms": 2000, "json_path": "a.b"
    }))
    .unwrap();
    let resp = proxy::websocket_test(req).await.unwrap();

    assert!(resp.connected);
    assert_eq!(resp.message["a"]["b"], 5);
    assert_eq!(resp.value, Some(json!(5)));
    assert!(resp.paths.unwrap().iter().any(|p| p.path == "a.b"));
}

// ============================================================================
// Socket.IO
// ============================================================================

const OPEN: &str = r#"0{"sid":"test-sid","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000}"#;

/// Wait until the request head is buffered and report whether it is an
/// upgrade
async fn is_upgrade(stream: &TcpStream) -> bool {
    let mut buf = vec![0u8; 4096];
    for _ in 0..100 {
        let n = stream.peek(&mut buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        if head.contains("\r\n\r\n") {
            return head.contains("upgrade: websocket");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn answer_polling(mut stream: TcpStream) {
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await;
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        OPEN.len(),
        OPEN
    );
    let _ = stream.write_all(resp.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Minimal Socket.IO v4 server: polling handshake, probe, connect, then
/// `frames` sent as individual WebSocket messages
async fn sio_server(frames: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let frames = frames.clone();
            tokio::spawn(async move {
                if !is_upgrade(&stream).await {
                    answer_polling(stream).await;
                    return;
                }
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    match text.as_str() {
                        "2probe" => {
                            let _ = ws.send(Message::Text("3probe".into())).await;
                        }
                        "40" => {
                            let _ = ws.send(Message::Text(r#"40{"sid":"ns-sid"}"#.into())).await;
                            let _ = ws.send(Message::Text("2".into())).await;
                            for f in &frames {
                                let _ = ws.send(Message::Text(f.clone())).await;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_socketio_fragmented_event_is_mapped() {
    let url = sio_server(vec![
        r#"42["other",{"cpu":{"usage":1}}]"#.into(),
        r#"42["telemetry",{"cpu":"#.into(),
        r#"{"usage":77},"host":"n1"}]"#.into(),
    ])
    .await;

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "sio",
        "type": "socketio",
        "url": url,
        "event": "telemetry",
        "mappings": [
            {"json_path": "cpu.usage", "var_name": "sio.cpu"},
            {"json_path": "host", "var_name": "sio.host"}
        ]
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.start_all();

    assert!(wait_for(&vars, "sio.cpu", Value::Int(77)).await);
    assert_eq!(vars.get("sio.host").unwrap(), Value::from("n1"));
    let snap = mgr.get_copy("sio").unwrap();
    assert!(snap.runtime.connected);
    // The "other" event is ignored
    assert_eq!(snap.runtime.messages, 1);

    mgr.stop_all().await;
}

#[tokio::test]
async fn test_socketio_probe_captures_named_event() {
    let url = sio_server(vec![
        r#"42["hello",{"x":1}]"#.into(),
        r#"42["stats",{"gpu":[{"temp":55}]}]"#.into(),
    ])
    .await;

    let req: SocketIoTestRequest = serde_json::from_value(json!({
        "url": url, "event": "stats", "timeout_ms": 3000, "json_path": "gpu[0].temp"
    }))
    .unwrap();
    let resp = proxy::socketio_test(&reqwest::Client::new(), req).await.unwrap();

    assert!(resp.connected);
    assert_eq!(resp.sid, "test-sid");
    assert_eq!(resp.event.as_deref(), Some("stats"));
    assert_eq!(resp.value, Some(json!(55)));
    assert!(resp.available_paths.iter().any(|p| p.path == "gpu"));
}

#[tokio::test]
async fn test_socketio_mapping_added_while_running() {
    let url = sio_server(vec![r#"42["telemetry",{"load":3}]"#.into()]).await;

    let (mgr, vars) = setup();
    let source = Source::from_json(&json!({
        "id": "live", "type": "socket.io", "uri": url, "event": "telemetry"
    }))
    .unwrap();
    mgr.add(source).unwrap();
    mgr.add_mapping("live", Mapping::new("load", "live.load")).unwrap();
    mgr.start_all();

    assert!(wait_for(&vars, "live.load", Value::Int(3)).await);
    mgr.stop_all().await;
}
