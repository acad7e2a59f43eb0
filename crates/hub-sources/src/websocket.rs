//! WebSocket streaming worker

use crate::error::{SourceError, SourceResult};
use crate::slot::SourceSlot;
use crate::source::{SourceKind, SourceState, WebSocketParams};
use crate::worker::{jittered, sleep_or_stop, stopped, WorkerEnv};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) enum SessionEnd {
    Stopped,
    Closed,
}

async fn session(
    slot: &SourceSlot,
    env: &WorkerEnv,
    params: &WebSocketParams,
    stop: &mut watch::Receiver<bool>,
) -> SourceResult<SessionEnd> {
    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(params.uri.as_str()))
        .await
        .map_err(|_| SourceError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;
    slot.mark_connected();

    let (mut write, mut read) = ws.split();
    if let Some(sub) = &params.subscribe {
        write.send(Message::Text(sub.clone())).await?;
    }

    loop {
        tokio::select! {
            _ = stopped(stop) => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Stopped);
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    slot.ingest_text(&text, &env.vars);
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        slot.ingest_text(text, &env.vars);
                    }
                    Err(_) => slot.count_non_json(),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(source = %slot.id(), ?frame, "Server closed WebSocket");
                    return Ok(SessionEnd::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Closed),
            }
        }
    }
}

pub(crate) async fn run(slot: Arc<SourceSlot>, env: Arc<WorkerEnv>, mut stop: watch::Receiver<bool>) {
    loop {
        let params = match &slot.config().kind {
            SourceKind::WebSocket(p) => p.clone(),
            _ => break,
        };

        slot.set_state(SourceState::Connecting);
        match session(&slot, &env, &params, &mut stop).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Closed) => {
                info!(source = %slot.id(), "WebSocket disconnected");
                slot.mark_disconnected();
            }
            Err(e) => slot.mark_failed(&e),
        }

        slot.count_reconnect();
        let delay = jittered(Duration::from_millis(params.reconnect_ms.max(100)));
        if sleep_or_stop(&mut stop, delay).await {
            break;
        }
    }
    slot.reset_connection();
}
