//! Typed event channel exposed to the UI layer
//!
//! Every event has exactly one payload shape. Events are fanned out over a
//! tokio broadcast channel; publishing never blocks and never fails when
//! nobody is listening.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{BackendKind, DownloadProgress, InitProgress, PullProgress};

const EVENT_CAPACITY: usize = 256;

/// Event emitted by the supervisor, the managers and the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceEvent {
    /// A backend became ready (daemon healthy, native runtime initialized)
    Ready { backend: BackendKind },
    Error { backend: BackendKind, message: String },
    /// Periodic daemon liveness
    Health { running: bool },
    PullProgress(PullProgress),
    ChatToken { backend: BackendKind, text: String },
    ModelLoaded { backend: BackendKind, model: String },
    ModelUnloaded { backend: BackendKind, model: String },
    DownloadProgress(DownloadProgress),
    InitProgress(InitProgress),
    /// Native runtime disposed
    Disposed,
    BackendSwitched { backend: BackendKind },
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InferenceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InferenceEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: InferenceEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain everything currently queued on a receiver (test helper).
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<InferenceEvent>) -> Vec<InferenceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
