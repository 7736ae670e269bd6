use std::sync::Arc;

use async_trait::async_trait;

use super::{BackendCapabilities, ChatStream, InferenceBackend};
use crate::browser::BrowserEngineAdapter;
use crate::error::Result;
use crate::types::{BackendKind, ChatMessage, ModelDescriptor};

/// Worker-hosted WebGPU engine backend
pub struct BrowserBackend {
    adapter: Arc<BrowserEngineAdapter>,
    use_tools: bool,
}

impl BrowserBackend {
    pub fn new(adapter: Arc<BrowserEngineAdapter>) -> Self {
        Self {
            adapter,
            use_tools: true,
        }
    }

    /// Use plain completions instead of the tool loop
    pub fn without_tools(mut self) -> Self {
        self.use_tools = false;
        self
    }

    pub fn adapter(&self) -> &Arc<BrowserEngineAdapter> {
        &self.adapter
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            vision: true,
            embeddings: false,
            gpu: true,
            streaming: true,
            tool_calling: true,
            structured_output: false,
        }
    }
}

#[async_trait]
impl InferenceBackend for BrowserBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BrowserEngine
    }

    fn name(&self) -> &'static str {
        "WebLLM"
    }

    fn description(&self) -> &'static str {
        "In-browser WebGPU inference with prebuilt models"
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::static_capabilities()
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.adapter.cancel_generation();
        self.adapter.cancel_loading();
        self.adapter.unload().await;
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        Ok(self.adapter.list_models())
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        self.adapter.initialize(model).await
    }

    async fn unload_model(&self) -> Result<()> {
        self.adapter.unload().await;
        Ok(())
    }

    async fn current_model(&self) -> Option<String> {
        self.adapter.current_model()
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        if self.use_tools {
            Ok(Box::pin(self.adapter.generate_completion_with_tools(messages)?))
        } else {
            Ok(Box::pin(self.adapter.generate_completion(messages)?))
        }
    }

    fn cancel_loading(&self) {
        self.adapter.cancel_loading();
    }

    fn cancel_generation(&self) {
        self.adapter.cancel_generation();
    }
}
