//! Pluggable inference backend abstraction
//!
//! The browser engine, the daemon and the native runtime all implement
//! [`InferenceBackend`], so the gateway can dispatch to whichever one is
//! selected without knowing which it is.

mod browser;
mod daemon;
mod native;
pub mod registry;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{InferenceError, Result};
use crate::types::{BackendKind, ChatMessage, ModelDescriptor};

pub use browser::BrowserBackend;
pub use daemon::DaemonBackend;
pub use native::NativeBackend;
pub use registry::BackendRegistry;

/// Stream of content deltas from one generation. Single consumer; not
/// restartable.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Capabilities that a backend may or may not support
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Supports vision/multimodal models (image + text)
    pub vision: bool,
    /// Supports embedding generation
    pub embeddings: bool,
    /// Has GPU acceleration available
    pub gpu: bool,
    /// Supports streaming token output
    pub streaming: bool,
    /// Supports tool/function calling
    pub tool_calling: bool,
    /// Supports grammar-constrained JSON output
    pub structured_output: bool,
}

/// Backend information for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    /// Human-readable name (e.g., "Ollama", "WebLLM")
    pub name: String,
    pub description: String,
    pub capabilities: BackendCapabilities,
    /// Whether this backend is the selected one
    pub active: bool,
    /// Whether this backend is available (dependencies met)
    pub available: bool,
    /// Reason if unavailable
    pub unavailable_reason: Option<String>,
}

/// The core trait that all inference backends implement.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    // ─── IDENTITY ───────────────────────────────────────────────────

    fn kind(&self) -> BackendKind;

    /// Human-readable name for UI display
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// `(available, reason)`; backends without external dependencies are
    /// always available
    fn availability(&self) -> (bool, Option<String>) {
        (true, None)
    }

    fn info(&self) -> BackendInfo {
        let (available, unavailable_reason) = self.availability();
        BackendInfo {
            kind: self.kind(),
            name: self.name().to_string(),
            description: self.description().to_string(),
            capabilities: self.capabilities(),
            active: false,
            available,
            unavailable_reason,
        }
    }

    // ─── LIFECYCLE ──────────────────────────────────────────────────

    /// Bring the backend up (start the daemon, load the native runtime)
    async fn start(&self) -> Result<()>;

    /// Release everything the backend holds
    async fn stop(&self);

    // ─── MODELS ─────────────────────────────────────────────────────

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /// Make `model` the resident (or selected) model
    async fn load_model(&self, model: &str) -> Result<()>;

    async fn unload_model(&self) -> Result<()>;

    async fn current_model(&self) -> Option<String>;

    // ─── INFERENCE ──────────────────────────────────────────────────

    /// Stream a reply to `messages`, whose last element must be a user turn
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream>;

    /// Grammar-constrained generation returning the parsed value
    async fn chat_with_schema(
        &self,
        _messages: &[ChatMessage],
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(InferenceError::precondition(format!(
            "{} does not support structured output",
            self.name()
        )))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(InferenceError::precondition(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }

    // ─── CANCELLATION ───────────────────────────────────────────────

    /// Abort an in-flight load. Safe when nothing is loading.
    fn cancel_loading(&self) {}

    /// Abort an in-flight generation. Safe when nothing is generating.
    fn cancel_generation(&self);
}

/// End `stream` quietly once `cancel` fires. Dropping the inner stream
/// aborts whatever request feeds it.
pub(crate) fn until_canceled<S>(stream: S, cancel: CancellationToken) -> ChatStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut stream = Box::pin(stream);
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => item,
            };
            match item {
                Some(item) => yield item,
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_until_canceled_stops_yielding() {
        let cancel = CancellationToken::new();
        let source = futures_util::stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
        let mut stream = until_canceled(source, cancel.clone());

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
