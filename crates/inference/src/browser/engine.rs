//! Worker-hosted engine primitive
//!
//! The engine itself lives behind a worker boundary in the host. This crate
//! only drives it through [`BrowserEngineHost`] (capability probe and engine
//! construction) and [`WorkerEngine`] (completions and unload).

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;
use crate::tools::{ToolCallDelta, ToolDefinition};
use crate::types::{ChatMessage, ModelDescriptor, ToolCall};

/// Raw failure reported by the engine or its worker
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<EngineError> for InferenceError {
    fn from(err: EngineError) -> Self {
        InferenceError::classify(err.message)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Options applied when the engine is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInitOptions {
    pub context_window_size: u32,
}

/// Init progress as the engine reports it. `progress` is a fraction in
/// 0..=1 when present; otherwise the percentage may be embedded in `text`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitReport {
    pub progress: Option<f64>,
    pub text: String,
}

/// Progress callback. Returning `Break` asks the host to abort the load.
pub type ProgressCallback = Arc<dyn Fn(InitReport) -> ControlFlow<()> + Send + Sync>;

/// OpenAI-compatible completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    pub stream: bool,
}

/// One streamed completion delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionDelta {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

/// Non-streaming completion result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = EngineResult<CompletionDelta>> + Send>>;

/// Host side of the engine: device probing and engine construction
#[async_trait]
pub trait BrowserEngineHost: Send + Sync {
    /// Whether the host exposes the GPU API at all
    fn gpu_available(&self) -> bool;

    /// Maximum storage-buffer bindings per shader stage, if it can be probed
    async fn max_storage_buffers_per_shader_stage(&self) -> Option<u32>;

    /// Prebuilt models the engine can load
    fn prebuilt_models(&self) -> Vec<ModelDescriptor>;

    /// Build an engine for `model`, downloading and compiling as needed
    async fn create_engine(
        &self,
        model: &str,
        options: EngineInitOptions,
        on_progress: ProgressCallback,
    ) -> EngineResult<Arc<dyn WorkerEngine>>;
}

/// A loaded engine living in a worker
#[async_trait]
pub trait WorkerEngine: Send + Sync {
    async fn chat_completion_stream(&self, request: CompletionRequest) -> EngineResult<DeltaStream>;

    async fn chat_completion(&self, request: CompletionRequest) -> EngineResult<CompletionResponse>;

    /// Stop the current generation at the next token boundary
    fn interrupt(&self);

    async fn unload(&self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_engine_errors_are_classified() {
        let err: InferenceError =
            EngineError::new("Device error: exceeded storage buffer limit").into();
        assert_eq!(err.category(), ErrorCategory::ResourceLimit);

        let err: InferenceError = EngineError::new("Failed to fetch shard 3").into();
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_request_omits_absent_tools() {
        let request = CompletionRequest {
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.6,
            top_p: 0.9,
            max_tokens: 16,
            tools: None,
            stream: true,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
