//! Interface to the dynamically loaded native inference runtime
//!
//! The manager only ever talks to these traits. Handles are reference
//! counted so the manager can drop them in a fixed order; once disposed, a
//! handle reports errors whose message mentions "disposed".

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::options::{GpuBackend, ResolvedOptions};
use crate::error::InferenceError;

/// Token id produced by the runtime
pub type Token = u32;

/// Error reported by the binding, carrying the runtime's own message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BindingError {
    pub message: String,
}

impl BindingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The underlying handle was already disposed
    pub fn is_disposed(&self) -> bool {
        self.message.to_lowercase().contains("disposed")
    }
}

impl From<BindingError> for InferenceError {
    fn from(err: BindingError) -> Self {
        InferenceError::classify(err.message)
    }
}

pub type BindingResult<T> = std::result::Result<T, BindingError>;

/// Entry replayed into a chat session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryItem {
    System(String),
    User(String),
    Model(String),
}

/// Loads the runtime module
#[async_trait]
pub trait NativeRuntimeLoader: Send + Sync {
    /// GPU backends this machine and build can use
    async fn supported_gpu_backends(&self) -> BindingResult<Vec<GpuBackend>>;

    async fn load(&self, options: &ResolvedOptions) -> BindingResult<Arc<dyn NativeRuntime>>;
}

/// A loaded runtime instance
#[async_trait]
pub trait NativeRuntime: Send + Sync {
    async fn load_model(&self, path: &Path) -> BindingResult<Arc<dyn NativeModel>>;

    /// Compile a JSON Schema into a generation grammar
    async fn create_grammar_for_json_schema(
        &self,
        schema: &serde_json::Value,
    ) -> BindingResult<Arc<dyn Grammar>>;

    fn dispose(&self) -> BindingResult<()>;
}

/// A loaded model
#[async_trait]
pub trait NativeModel: Send + Sync {
    async fn create_context(&self) -> BindingResult<Arc<dyn NativeContext>>;

    async fn create_embedding_context(&self) -> BindingResult<Box<dyn EmbeddingContext>>;

    fn detokenize(&self, tokens: &[Token]) -> String;

    fn dispose(&self) -> BindingResult<()>;
}

/// Inference context; depends on its model staying alive
pub trait NativeContext: Send + Sync {
    /// Chat session bound to this context's sequence
    fn create_session(&self) -> BindingResult<Box<dyn ChatSession>>;

    fn dispose(&self) -> BindingResult<()>;
}

#[async_trait]
pub trait ChatSession: Send + Sync {
    fn set_chat_history(&mut self, history: Vec<HistoryItem>);

    /// Generate a reply to `text`, reporting token batches as they arrive.
    /// Generation stops early once `cancel` fires.
    async fn prompt(
        &mut self,
        text: &str,
        grammar: Option<&dyn Grammar>,
        cancel: &CancellationToken,
        on_tokens: &mut (dyn for<'t> FnMut(&'t [Token]) + Send),
    ) -> BindingResult<()>;
}

/// Compiled JSON-Schema grammar
pub trait Grammar: Send + Sync {
    /// Parse generated text into the structured value
    fn parse(&self, text: &str) -> BindingResult<serde_json::Value>;
}

/// Short-lived context for computing embeddings
#[async_trait]
pub trait EmbeddingContext: Send + Sync {
    async fn embedding_for(&self, text: &str) -> BindingResult<Vec<f32>>;

    fn dispose(&self) -> BindingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposed_detection() {
        assert!(BindingError::new("Object is Disposed").is_disposed());
        assert!(!BindingError::new("file not found").is_disposed());
    }

    #[test]
    fn test_binding_error_translation() {
        let err: InferenceError = BindingError::new("Context has been disposed").into();
        assert!(matches!(err, InferenceError::HandleDisposed(_)));

        let err: InferenceError = BindingError::new("CUDA out of memory").into();
        assert!(matches!(err, InferenceError::ResourceLimitExceeded(_)));
    }
}
