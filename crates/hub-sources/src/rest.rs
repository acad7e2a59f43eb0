//! REST polling worker

use crate::error::{SourceError, SourceResult};
use crate::slot::SourceSlot;
use crate::source::{RestParams, SourceKind, SourceState};
use crate::worker::{sleep_or_stop, stopped, WorkerEnv};
use reqwest::header::AUTHORIZATION;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Largest response body a REST source accepts
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// RPC method for a URL that points at this hub's own API
///
/// `http://127.0.0.1/api/v1/system/memory?x=1` maps to `system.memory`.
pub fn local_method(url: &str) -> Option<String> {
    if !(url.contains("://127.0.0.1") || url.contains("://localhost")) {
        return None;
    }
    let (_, rest) = url.split_once("/api/v1/")?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let method = rest.trim_matches('/').replace('/', ".");
    (!method.is_empty()).then_some(method)
}

/// Read a response body, failing once it grows past `limit`
pub(crate) async fn read_bounded(
    mut resp: reqwest::Response,
    limit: usize,
    timeout_ms: u64,
) -> SourceResult<Vec<u8>> {
    if resp.content_length().is_some_and(|n| n > limit as u64) {
        return Err(SourceError::BodyTooLarge { limit });
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| SourceError::from_http(e, timeout_ms))?
    {
        if body.len() + chunk.len() > limit {
            return Err(SourceError::BodyTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn fetch(env: &WorkerEnv, params: &RestParams) -> SourceResult<serde_json::Value> {
    if let Some(method) = local_method(&params.url) {
        if let Some(api) = env.local_api() {
            trace!(%method, "Local API short-circuit");
            return Ok(api.call(&method, serde_json::json!({})).await?);
        }
    }

    let method = reqwest::Method::from_bytes(params.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| SourceError::InvalidConfig(format!("bad method {}", params.method)))?;
    let mut req = env
        .http
        .request(method, &params.url)
        .timeout(Duration::from_millis(params.timeout_ms));
    if let Some(auth) = params.auth_header.as_deref().filter(|a| !a.is_empty()) {
        req = req.header(AUTHORIZATION, auth);
    }
    for (name, value) in &params.headers {
        req = req.header(name.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| SourceError::from_http(e, params.timeout_ms))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }

    let body = read_bounded(resp, MAX_BODY_LEN, params.timeout_ms).await?;
    serde_json::from_slice(&body).map_err(|e| SourceError::NotJson(e.to_string()))
}

/// Fetch once and run the mapping engine
pub(crate) async fn poll_once(slot: &SourceSlot, env: &WorkerEnv) -> SourceResult<()> {
    let params = match &slot.config().kind {
        SourceKind::Rest(p) => p.clone(),
        other => return Err(SourceError::NotPollable(other.type_name())),
    };

    if !slot.runtime().connected {
        slot.set_state(SourceState::Connecting);
    }
    match fetch(env, &params).await {
        Ok(payload) => {
            slot.mark_connected();
            let last = payload.clone();
            slot.ingest(&payload, last, &env.vars);
            Ok(())
        }
        Err(e) => {
            slot.mark_failed(&e);
            Err(e)
        }
    }
}

pub(crate) async fn run(slot: Arc<SourceSlot>, env: Arc<WorkerEnv>, mut stop: watch::Receiver<bool>) {
    loop {
        if let Err(e) = poll_once(&slot, &env).await {
            debug!(source = %slot.id(), error = %e, "REST poll failed");
        }
        let period = slot.config().poll_interval();
        match period {
            Some(period) => {
                if sleep_or_stop(&mut stop, period).await {
                    break;
                }
            }
            None => {
                stopped(&mut stop).await;
                break;
            }
        }
    }
    slot.reset_connection();
}
