use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{until_canceled, BackendCapabilities, ChatStream, InferenceBackend};
use crate::daemon::DaemonSupervisor;
use crate::error::{InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::types::{require_user_last, BackendKind, ChatMessage, ModelDescriptor};

/// Model-serving daemon backend
///
/// The daemon keeps its own models resident, so "loading" only selects the
/// tag that subsequent chats are sent to.
pub struct DaemonBackend {
    supervisor: Arc<DaemonSupervisor>,
    binary: String,
    events: EventBus,
    model: RwLock<Option<String>>,
    generation: Mutex<CancellationToken>,
}

impl DaemonBackend {
    pub fn new(supervisor: Arc<DaemonSupervisor>, binary: impl Into<String>, events: EventBus) -> Self {
        Self {
            supervisor,
            binary: binary.into(),
            events,
            model: RwLock::new(None),
            generation: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<DaemonSupervisor> {
        &self.supervisor
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            vision: true,
            embeddings: false,
            gpu: true,
            streaming: true,
            tool_calling: false,
            structured_output: false,
        }
    }

    /// Check if the daemon binary is on PATH
    pub fn check_availability(binary: &str) -> (bool, Option<String>) {
        if which::which(binary).is_ok() {
            (true, None)
        } else {
            (
                false,
                Some(format!("{} not found in PATH. Install it from ollama.com", binary)),
            )
        }
    }
}

#[async_trait]
impl InferenceBackend for DaemonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Daemon
    }

    fn name(&self) -> &'static str {
        "Ollama"
    }

    fn description(&self) -> &'static str {
        "Local model-serving daemon with automatic model management"
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::static_capabilities()
    }

    fn availability(&self) -> (bool, Option<String>) {
        Self::check_availability(&self.binary)
    }

    async fn start(&self) -> Result<()> {
        self.supervisor.start().await
    }

    async fn stop(&self) {
        self.cancel_generation();
        self.supervisor.stop().await;
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.supervisor.client().list_models().await
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        if model.trim().is_empty() {
            return Err(InferenceError::precondition("Model name must not be empty"));
        }
        let previous = self.model.write().replace(model.to_string());
        if previous.as_deref() != Some(model) {
            log::info!("Daemon model set to {}", model);
            self.events.emit(InferenceEvent::ModelLoaded {
                backend: BackendKind::Daemon,
                model: model.to_string(),
            });
        }
        Ok(())
    }

    async fn unload_model(&self) -> Result<()> {
        if let Some(model) = self.model.write().take() {
            self.events.emit(InferenceEvent::ModelUnloaded {
                backend: BackendKind::Daemon,
                model,
            });
        }
        Ok(())
    }

    async fn current_model(&self) -> Option<String> {
        self.model.read().clone()
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        require_user_last(messages)?;
        let model = self.model.read().clone().ok_or_else(|| {
            InferenceError::precondition("No daemon model selected. Please select a model first.")
        })?;

        let cancel = CancellationToken::new();
        *self.generation.lock() = cancel.clone();

        let stream = self.supervisor.client().chat_stream(&model, messages).await?;
        Ok(until_canceled(stream, cancel))
    }

    fn cancel_generation(&self) {
        self.generation.lock().cancel();
    }
}
