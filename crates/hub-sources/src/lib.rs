//! Telemetry sources for the automation hub
//!
//! A source is a long-lived ingestion task: a REST poller, a WebSocket or
//! Socket.IO stream, or an SSH command run on a schedule. Every accepted
//! payload goes through the mapping engine, which extracts values by path
//! and writes them into the variable store.

pub mod error;
pub mod manager;
pub mod mapping;
pub mod proxy;
pub mod rest;
pub mod sio;
mod slot;
pub mod socketio;
pub mod source;
pub mod variable;
pub mod websocket;
mod worker;

pub use error::{SourceError, SourceResult};
pub use manager::{SourceManager, SourceStats, MAX_SOURCES, WORKER_STOP_GRACE};
pub use mapping::{apply_mapping, apply_mappings, MappingOutcome};
pub use proxy::{
    FetchRequest, FetchResponse, SocketIoTestRequest, SocketIoTestResponse, WebSocketTestRequest,
    WebSocketTestResponse,
};
pub use source::{
    Mapping, RestParams, SocketIoParams, Source, SourceKind, SourceRuntime, SourceSnapshot,
    SourceState, VariableParams, WebSocketParams, MAX_MAPPINGS,
};
pub use variable::{SshBundle, BUNDLE_SUFFIXES};
pub use worker::{LocalApi, SshAccess};
