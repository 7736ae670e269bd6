use std::path::PathBuf;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BackendCapabilities, ChatStream, InferenceBackend};
use crate::error::{InferenceError, Result};
use crate::native::{ModelDownloader, NativeRuntimeManager, SetOptions};
use crate::types::{require_user_last, BackendKind, ChatMessage, ModelDescriptor};

/// In-process native runtime backend
pub struct NativeBackend {
    manager: Arc<NativeRuntimeManager>,
    downloader: ModelDownloader,
    generation: Mutex<CancellationToken>,
}

impl NativeBackend {
    pub fn new(manager: Arc<NativeRuntimeManager>, downloader: ModelDownloader) -> Self {
        Self {
            manager,
            downloader,
            generation: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn manager(&self) -> &Arc<NativeRuntimeManager> {
        &self.manager
    }

    pub fn downloader(&self) -> &ModelDownloader {
        &self.downloader
    }

    pub fn static_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            vision: false,
            embeddings: true,
            gpu: true,
            streaming: true,
            tool_calling: false,
            structured_output: true,
        }
    }

    /// Bare file names resolve inside the models directory
    fn resolve_path(&self, model: &str) -> PathBuf {
        let path = PathBuf::from(model);
        if path.is_absolute() {
            path
        } else {
            self.manager.models_directory().join(path)
        }
    }

    fn begin_generation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.generation.lock() = token.clone();
        token
    }
}

#[async_trait]
impl InferenceBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeRuntime
    }

    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn description(&self) -> &'static str {
        "In-process llama.cpp runtime with GGUF model support"
    }

    fn capabilities(&self) -> BackendCapabilities {
        Self::static_capabilities()
    }

    async fn start(&self) -> Result<()> {
        self.manager.initialize(SetOptions::default()).await
    }

    async fn stop(&self) {
        self.cancel_generation();
        self.manager.dispose().await;
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.manager.list_models().await
    }

    async fn load_model(&self, model: &str) -> Result<()> {
        self.manager.load_model(&self.resolve_path(model)).await
    }

    async fn unload_model(&self) -> Result<()> {
        self.manager.unload_model().await;
        Ok(())
    }

    async fn current_model(&self) -> Option<String> {
        self.manager
            .current_model()
            .await
            .map(|path| path.display().to_string())
    }

    /// Generation runs on its own task and forwards tokens over a channel;
    /// the final manager result is surfaced after the last token.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        require_user_last(messages)?;
        if !self.manager.is_model_loaded().await {
            return Err(InferenceError::precondition(
                "No model loaded. Please load a model first.",
            ));
        }

        let cancel = self.begin_generation();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let manager = self.manager.clone();
        let messages = messages.to_vec();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            manager
                .chat(&messages, &task_cancel, move |token: &str| {
                    let _ = tx.send(token.to_string());
                })
                .await
        });

        // Dropping the stream early stops the generation task
        let guard = cancel.clone().drop_guard();
        Ok(Box::pin(try_stream! {
            while let Some(token) = rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                yield token;
            }
            let finished = handle.await;
            let _ = guard.disarm();
            match finished {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_canceled() => {}
                Ok(Err(e)) => Err::<(), _>(e)?,
                Err(e) => Err::<(), _>(InferenceError::Unknown(format!("generation task failed: {}", e)))?,
            }
        }))
    }

    async fn chat_with_schema(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let cancel = self.begin_generation();
        self.manager
            .chat_with_schema(messages, schema, &cancel, |_| {})
            .await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.manager.get_embedding(text).await
    }

    fn cancel_generation(&self) {
        self.generation.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::config::NativeRuntimeConfig;
    use crate::events::EventBus;
    use crate::native::mock::MockLoader;

    fn backend(dir: &std::path::Path) -> (NativeBackend, MockLoader) {
        let loader = MockLoader::new();
        let config = NativeRuntimeConfig {
            models_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let events = EventBus::new();
        let manager = NativeRuntimeManager::new(
            &config,
            Arc::new(MockLoader {
                state: loader.state.clone(),
            }),
            events.clone(),
        )
        .with_env(crate::native::options::empty_env());
        let downloader = ModelDownloader::new(dir.to_path_buf(), events);
        (NativeBackend::new(Arc::new(manager), downloader), loader)
    }

    #[tokio::test]
    async fn test_chat_stream_forwards_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _loader) = backend(dir.path());
        backend.start().await.unwrap();
        backend.load_model("a.gguf").await.unwrap();
        assert_eq!(
            backend.current_model().await,
            Some(dir.path().join("a.gguf").display().to_string())
        );

        let stream = backend.chat_stream(&[ChatMessage::user("hi")]).await.unwrap();
        let text: String = stream.map(|t| t.unwrap()).collect::<Vec<_>>().await.concat();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, loader) = backend(dir.path());
        *loader.state.reply.lock() = "x".repeat(10_000);
        backend.start().await.unwrap();
        backend.load_model("a.gguf").await.unwrap();

        let mut stream = backend.chat_stream(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "x");
        drop(stream);

        assert!(backend.generation.lock().is_cancelled());
        tokio::time::timeout(std::time::Duration::from_secs(2), backend.unload_model())
            .await
            .expect("manager released after the stream was dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_chat_without_model_is_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, loader) = backend(dir.path());
        backend.start().await.unwrap();

        let err = backend.chat_stream(&[ChatMessage::user("hi")]).await.err().unwrap();
        assert!(err.to_string().contains("No model loaded"));
        assert_eq!(
            loader.state.prompts.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_schema_and_embedding_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _loader) = backend(dir.path());
        backend.start().await.unwrap();
        backend.load_model("a.gguf").await.unwrap();

        let value = backend
            .chat_with_schema(&[ChatMessage::user("answer?")], &serde_json::json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(value["answer"], 42);
        assert_eq!(backend.embed("abcd").await.unwrap(), vec![4.0, 0.5, 0.25]);
    }
}
