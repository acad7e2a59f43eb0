//! Connection probes run on behalf of the UI
//!
//! Each probe makes one short-lived connection, reports what came back and
//! the payload's path shape, so a user can pick mappings before creating a
//! source.

use crate::error::{SourceError, SourceResult};
use crate::rest::read_bounded;
use crate::sio::{self, Assembled, FrameAssembler, Packet};
use crate::socketio::open_session;
use futures_util::{SinkExt, StreamExt};
use hub_core::path::{self, PathEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, instrument};

/// Largest body a fetch probe returns
pub const MAX_PROBE_BODY: usize = 64 * 1024;

fn default_get() -> String {
    "GET".to_string()
}

fn default_fetch_timeout() -> u64 {
    10_000
}

fn default_ws_timeout() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_get")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_fetch_timeout", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub content_length: usize,
    /// Parsed JSON when the body is JSON, the raw text otherwise
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathEntry>>,
}

#[instrument(skip(http, req), fields(url = %req.url))]
pub async fn fetch(http: &reqwest::Client, req: FetchRequest) -> SourceResult<FetchResponse> {
    let method = reqwest::Method::from_bytes(req.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| SourceError::InvalidConfig(format!("bad method {}", req.method)))?;
    if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
        return Err(SourceError::InvalidConfig(format!("bad url {}", req.url)));
    }

    let mut builder = http
        .request(method, &req.url)
        .timeout(Duration::from_millis(req.timeout_ms));
    for (name, value) in &req.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = req.body {
        builder = builder.body(body);
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| SourceError::from_http(e, req.timeout_ms))?;
    let status = resp.status().as_u16();
    let bytes = read_bounded(resp, MAX_PROBE_BODY, req.timeout_ms).await?;

    let (body, paths) = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(json) => {
            let paths = path::enumerate(&json);
            (json, Some(paths))
        }
        Err(_) => (
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            None,
        ),
    };
    debug!(status, len = bytes.len(), "Fetch probe done");
    Ok(FetchResponse {
        status,
        content_length: bytes.len(),
        body,
        paths,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketTestRequest {
    #[serde(alias = "url")]
    pub uri: String,
    #[serde(default = "default_ws_timeout", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub subscribe: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSocketTestResponse {
    pub connected: bool,
    /// First message, parsed when it is JSON
    pub message: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Parsed form of a probe message plus its shape and the selected value
fn inspect(
    text: &str,
    json_path: Option<&str>,
) -> (serde_json::Value, Option<Vec<PathEntry>>, Option<serde_json::Value>) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => {
            let paths = path::enumerate(&json);
            let value = json_path.and_then(|p| path::extract(&json, p)).cloned();
            (json, Some(paths), value)
        }
        Err(_) => (serde_json::Value::String(text.to_string()), None, None),
    }
}

#[instrument(skip(req), fields(uri = %req.uri))]
pub async fn websocket_test(req: WebSocketTestRequest) -> SourceResult<WebSocketTestResponse> {
    let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);

    let (mut ws, _) = tokio::select! {
        _ = sleep_until(deadline) => return Err(SourceError::Timeout(req.timeout_ms)),
        res = connect_async(req.uri.as_str()) => res?,
    };
    if let Some(sub) = &req.subscribe {
        ws.send(Message::Text(sub.clone())).await?;
    }

    loop {
        let frame = tokio::select! {
            _ = sleep_until(deadline) => {
                let _ = ws.close(None).await;
                return Ok(WebSocketTestResponse {
                    connected: true,
                    message: serde_json::Value::Null,
                    paths: None,
                    value: None,
                });
            }
            frame = ws.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(t))) => t,
            Some(Ok(Message::Binary(b))) => String::from_utf8_lossy(&b).into_owned(),
            Some(Ok(Message::Close(_))) | None => {
                return Err(SourceError::Connection("closed before first message".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        let _ = ws.close(None).await;
        let (message, paths, value) = inspect(&text, req.json_path.as_deref());
        return Ok(WebSocketTestResponse {
            connected: true,
            message,
            paths,
            value,
        });
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketIoTestRequest {
    #[serde(alias = "uri")]
    pub url: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default = "default_fetch_timeout", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub json_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SocketIoTestResponse {
    pub connected: bool,
    pub sid: String,
    /// Name of the event that was captured
    pub event: Option<String>,
    pub data: serde_json::Value,
    pub available_paths: Vec<PathEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Connect, then wait for the first event (or the named one)
#[instrument(skip(http, req), fields(url = %req.url))]
pub async fn socketio_test(
    http: &reqwest::Client,
    req: SocketIoTestRequest,
) -> SourceResult<SocketIoTestResponse> {
    let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);
    let (open, mut ws) = tokio::select! {
        _ = sleep_until(deadline) => return Err(SourceError::Timeout(req.timeout_ms)),
        res = open_session(http, &req.url) => res?,
    };

    let mut response = SocketIoTestResponse {
        connected: false,
        sid: open.sid.clone(),
        event: None,
        data: serde_json::Value::Null,
        available_paths: Vec::new(),
        value: None,
    };
    let mut assembler = FrameAssembler::new();

    loop {
        let frame = tokio::select! {
            _ = sleep_until(deadline) => break,
            frame = ws.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(t))) => t,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        for piece in assembler.push(&text) {
            let Assembled::Frame(frame) = piece else {
                continue;
            };
            match sio::decode(&frame) {
                Packet::Ping => ws.send(Message::Text(sio::PONG.into())).await?,
                Packet::Connected => response.connected = true,
                Packet::ConnectError(msg) => return Err(SourceError::Handshake(msg)),
                Packet::Event { name, data } => {
                    if req.event.as_deref().is_some_and(|e| e != name) {
                        continue;
                    }
                    response.connected = true;
                    response.available_paths = path::enumerate(&data);
                    response.value = req
                        .json_path
                        .as_deref()
                        .and_then(|p| path::extract(&data, p))
                        .cloned();
                    response.event = Some(name);
                    response.data = data;
                    let _ = ws.close(None).await;
                    return Ok(response);
                }
                _ => {}
            }
        }
    }

    let _ = ws.close(None).await;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_json_reports_paths() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cpu": {"usage": 12}})))
            .mount(&server)
            .await;

        let req: FetchRequest =
            serde_json::from_value(json!({"url": format!("{}/stats", server.uri())})).unwrap();
        let resp = fetch(&reqwest::Client::new(), req).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["cpu"]["usage"], 12);
        let paths = resp.paths.unwrap();
        assert!(paths.iter().any(|p| p.path == "cpu.usage" && p.kind == "number"));
    }

    #[tokio::test]
    async fn test_fetch_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such page"))
            .mount(&server)
            .await;

        let req: FetchRequest = serde_json::from_value(json!({
            "url": server.uri(), "method": "post", "body": "{}"
        }))
        .unwrap();
        let resp = fetch(&reqwest::Client::new(), req).await.unwrap();

        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, json!("no such page"));
        assert!(resp.paths.is_none());
    }

    #[test]
    fn test_inspect_extracts_value() {
        let (msg, paths, value) = inspect(r#"{"a":{"b":[7,8]}}"#, Some("a.b[1]"));
        assert_eq!(msg["a"]["b"][0], 7);
        assert!(paths.is_some());
        assert_eq!(value, Some(json!(8)));

        let (msg, paths, value) = inspect("hello", Some("a"));
        assert_eq!(msg, json!("hello"));
        assert!(paths.is_none() && value.is_none());
    }
}
