//! HTTP transport for the RPC registry

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hub_core::HubError;
use hub_rpc::{RpcRegistry, RpcRequest, RpcResponse};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RpcRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<RpcRegistry>) -> Self {
        Self { registry }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/v1/*path", post(rpc_call))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: AppState, addr: &str) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router).await
}

async fn health_check() -> &'static str {
    "OK"
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn bad_request(message: String) -> Response {
    let body = RpcResponse::error(&HubError::InvalidArgument(message));
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// POST /api/v1/rpc with an envelope, or /api/v1/<method/as/path> with the
/// params as body
async fn rpc_call(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: JsonValue = if body.iter().all(u8::is_ascii_whitespace) {
        JsonValue::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return bad_request(format!("malformed JSON: {}", e)),
        }
    };

    let (method, params) = if path == "rpc" {
        match serde_json::from_value::<RpcRequest>(payload) {
            Ok(req) => (req.method, req.params),
            Err(e) => return bad_request(format!("invalid request: {}", e)),
        }
    } else {
        (path.trim_matches('/').replace('/', "."), payload)
    };

    let response = state
        .registry
        .call(&method, params, bearer_token(&headers))
        .await;
    Json(response).into_response()
}
