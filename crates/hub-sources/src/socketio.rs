//! Socket.IO v4 worker
//!
//! Connects with the polling handshake, upgrades to WebSocket and feeds
//! events named by the source's `event` to the mapping engine.

use crate::error::{SourceError, SourceResult};
use crate::rest::read_bounded;
use crate::sio::{self, Assembled, FrameAssembler, OpenPacket, Packet};
use crate::slot::SourceSlot;
use crate::source::{SocketIoParams, SourceKind, SourceState};
use crate::websocket::{SessionEnd, CONNECT_TIMEOUT};
use crate::worker::{jittered, sleep_or_stop, stopped, WorkerEnv};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backoff ceiling between reconnect attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Silence after which the connection is considered dead
pub const HEARTBEAT_SILENCE: Duration = Duration::from_secs(30);

const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Polling handshake: fetch the session id
pub(crate) async fn handshake(http: &reqwest::Client, base: &str) -> SourceResult<OpenPacket> {
    let url = sio::handshake_url(base);
    trace!(%url, "Socket.IO handshake");
    let resp = http
        .get(&url)
        .timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS))
        .send()
        .await
        .map_err(|e| SourceError::from_http(e, HANDSHAKE_TIMEOUT_MS))?;
    if !resp.status().is_success() {
        return Err(SourceError::Status(resp.status().as_u16()));
    }
    let body = read_bounded(resp, 4096, HANDSHAKE_TIMEOUT_MS).await?;
    let text = String::from_utf8_lossy(&body);
    sio::parse_open(&text)
        .ok_or_else(|| SourceError::Handshake(format!("no session id in '{}'", text.trim())))
}

/// Handshake, upgrade, probe and namespace connect
///
/// Returns once `40` has been sent; the server's connect acknowledgement
/// arrives on the returned stream.
pub(crate) async fn open_session(
    http: &reqwest::Client,
    base: &str,
) -> SourceResult<(OpenPacket, WsStream)> {
    let open = handshake(http, base).await?;
    let url = sio::upgrade_url(base, &open.sid);

    let (mut ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| SourceError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

    ws.send(Message::Text(sio::PROBE.into())).await?;
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let frame = tokio::select! {
            _ = sleep_until(deadline) => {
                return Err(SourceError::Handshake("no answer to probe".into()));
            }
            frame = ws.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(t))) if t == sio::PROBE_ACK => break,
            Some(Ok(Message::Text(t))) if t == sio::PING => {
                ws.send(Message::Text(sio::PONG.into())).await?;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(SourceError::Handshake("closed during probe".into())),
        }
    }

    ws.send(Message::Text(sio::UPGRADE.into())).await?;
    ws.send(Message::Text(sio::CONNECT.into())).await?;
    debug!(sid = %open.sid, "Socket.IO upgraded");
    Ok((open, ws))
}

/// Last value reported for an event payload
fn last_value_of(data: &serde_json::Value) -> serde_json::Value {
    if data.to_string().len() > 50 {
        serde_json::Value::String(sio::summarize(data))
    } else {
        data.clone()
    }
}

async fn session(
    slot: &SourceSlot,
    env: &WorkerEnv,
    params: &SocketIoParams,
    stop: &mut watch::Receiver<bool>,
    established: &mut bool,
) -> SourceResult<SessionEnd> {
    let (open, ws) = tokio::select! {
        _ = stopped(stop) => return Ok(SessionEnd::Stopped),
        res = open_session(&env.http, &params.url) => res?,
    };
    let (mut write, mut read) = ws.split();
    let mut assembler = FrameAssembler::new();
    let mut last_seen = Instant::now();

    loop {
        let frame = tokio::select! {
            _ = stopped(stop) => {
                let _ = write.send(Message::Text("41".into())).await;
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Stopped);
            }
            _ = sleep_until(last_seen + HEARTBEAT_SILENCE) => {
                warn!(source = %slot.id(), sid = %open.sid, "Socket.IO heartbeat lost");
                return Err(SourceError::Timeout(HEARTBEAT_SILENCE.as_millis() as u64));
            }
            frame = read.next() => frame,
        };
        last_seen = Instant::now();

        let text = match frame {
            Some(Ok(Message::Text(t))) => t,
            Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        for piece in assembler.push(&text) {
            let frame = match piece {
                Assembled::Frame(f) => f,
                Assembled::Pending => continue,
                Assembled::Dropped => {
                    slot.count_non_json();
                    continue;
                }
            };
            match sio::decode(&frame) {
                Packet::Ping => write.send(Message::Text(sio::PONG.into())).await?,
                Packet::Connected => {
                    *established = true;
                    slot.mark_connected();
                }
                Packet::ConnectError(msg) => return Err(SourceError::Handshake(msg)),
                Packet::Disconnect | Packet::Close => return Ok(SessionEnd::Closed),
                Packet::Event { name, data } if name == params.event => {
                    let last = last_value_of(&data);
                    slot.ingest(&data, last, &env.vars);
                }
                Packet::Event { name, .. } => trace!(event = %name, "Ignoring event"),
                _ => {}
            }
        }
    }
}

/// Next reconnect delay: doubles while attempts keep failing, back to the
/// base after a successful connect
pub(crate) fn next_backoff(base: Duration, previous: Option<Duration>, established: bool) -> Duration {
    match (established, previous) {
        (false, Some(prev)) => (prev * 2).min(MAX_BACKOFF),
        _ => base.min(MAX_BACKOFF),
    }
}

pub(crate) async fn run(slot: Arc<SourceSlot>, env: Arc<WorkerEnv>, mut stop: watch::Receiver<bool>) {
    let mut backoff: Option<Duration> = None;
    loop {
        let params = match &slot.config().kind {
            SourceKind::SocketIo(p) => p.clone(),
            _ => break,
        };

        slot.set_state(SourceState::Connecting);
        let mut established = false;
        match session(&slot, &env, &params, &mut stop, &mut established).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Closed) => {
                info!(source = %slot.id(), "Socket.IO disconnected");
                slot.mark_disconnected();
            }
            Err(e) => slot.mark_failed(&e),
        }

        let base = Duration::from_millis(params.reconnect_ms.max(100));
        let delay = next_backoff(base, backoff, established);
        backoff = Some(delay);
        slot.count_reconnect();
        debug!(source = %slot.id(), delay_ms = delay.as_millis() as u64, "Socket.IO reconnect scheduled");
        if sleep_or_stop(&mut stop, jittered(delay)).await {
            break;
        }
    }
    slot.reset_connection();
}
