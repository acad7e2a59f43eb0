//! Push channel for streaming command output, keyed by session id
//!
//! Delivery is best effort: a publish to a missing or full channel is
//! counted and dropped.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    ExecStart { command: String },
    ExecOutput { data: String, is_stderr: bool },
    ExecDone { exit_code: i32 },
    ExecError { message: String },
    ExecCancelled,
}

#[derive(Default)]
pub struct ExecEventHub {
    sessions: DashMap<String, mpsc::Sender<ExecEvent>>,
    dropped: AtomicU64,
}

impl ExecEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session, replacing any previous one with the same id
    pub fn open(&self, session_id: &str, capacity: usize) -> mpsc::Receiver<ExecEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.sessions.insert(session_id.to_string(), tx);
        rx
    }

    pub fn close(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn publish(&self, session_id: &str, event: ExecEvent) {
        let delivered = match self.sessions.get(session_id) {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(session_id, "Exec event dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
