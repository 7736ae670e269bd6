//! In-memory binding used by tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::binding::*;
use super::options::{GpuBackend, ResolvedOptions};

/// Shared observation point for every handle the mock hands out
pub(crate) struct MockRuntimeState {
    pub runtime_loads: AtomicUsize,
    pub model_loads: AtomicUsize,
    pub prompts: AtomicUsize,
    /// Messages for upcoming `load_model` failures, consumed in order
    pub load_failures: Mutex<VecDeque<String>>,
    pub histories: Mutex<Vec<Vec<HistoryItem>>>,
    /// Disposal log, e.g. `context:a.gguf`, `model:a.gguf`, `runtime`
    pub disposals: Mutex<Vec<String>>,
    pub reply: Mutex<String>,
    pub fail_dispose: AtomicBool,
    pub fail_embedding: AtomicBool,
    pub last_options: Mutex<Option<ResolvedOptions>>,
    pub supported: Vec<GpuBackend>,
}

impl MockRuntimeState {
    pub fn disposals(&self) -> Vec<String> {
        self.disposals.lock().clone()
    }

    fn dispose(&self, what: String) -> BindingResult<()> {
        self.disposals.lock().push(what.clone());
        if self.fail_dispose.load(Ordering::SeqCst) {
            Err(BindingError::new(format!("{} is already disposed", what)))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct MockLoader {
    pub state: Arc<MockRuntimeState>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockRuntimeState {
                runtime_loads: AtomicUsize::new(0),
                model_loads: AtomicUsize::new(0),
                prompts: AtomicUsize::new(0),
                load_failures: Mutex::new(VecDeque::new()),
                histories: Mutex::new(Vec::new()),
                disposals: Mutex::new(Vec::new()),
                reply: Mutex::new("Hello world".to_string()),
                fail_dispose: AtomicBool::new(false),
                fail_embedding: AtomicBool::new(false),
                last_options: Mutex::new(None),
                supported: vec![GpuBackend::Vulkan],
            }),
        }
    }

    pub fn fail_next_loads(&self, messages: &[&str]) {
        let mut failures = self.state.load_failures.lock();
        failures.extend(messages.iter().map(|m| m.to_string()));
    }
}

#[async_trait]
impl NativeRuntimeLoader for MockLoader {
    async fn supported_gpu_backends(&self) -> BindingResult<Vec<GpuBackend>> {
        Ok(self.state.supported.clone())
    }

    async fn load(&self, options: &ResolvedOptions) -> BindingResult<Arc<dyn NativeRuntime>> {
        self.state.runtime_loads.fetch_add(1, Ordering::SeqCst);
        *self.state.last_options.lock() = Some(options.clone());
        Ok(Arc::new(MockRuntime {
            state: self.state.clone(),
        }))
    }
}

struct MockRuntime {
    state: Arc<MockRuntimeState>,
}

#[async_trait]
impl NativeRuntime for MockRuntime {
    async fn load_model(&self, path: &Path) -> BindingResult<Arc<dyn NativeModel>> {
        if let Some(message) = self.state.load_failures.lock().pop_front() {
            return Err(BindingError::new(message));
        }
        self.state.model_loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockModel {
            state: self.state.clone(),
            name: file_name(path),
        }))
    }

    async fn create_grammar_for_json_schema(
        &self,
        _schema: &serde_json::Value,
    ) -> BindingResult<Arc<dyn Grammar>> {
        Ok(Arc::new(JsonGrammar))
    }

    fn dispose(&self) -> BindingResult<()> {
        self.state.dispose("runtime".to_string())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

struct MockModel {
    state: Arc<MockRuntimeState>,
    name: String,
}

#[async_trait]
impl NativeModel for MockModel {
    async fn create_context(&self) -> BindingResult<Arc<dyn NativeContext>> {
        Ok(Arc::new(MockContext {
            state: self.state.clone(),
            name: self.name.clone(),
        }))
    }

    async fn create_embedding_context(&self) -> BindingResult<Box<dyn EmbeddingContext>> {
        Ok(Box::new(MockEmbedding {
            state: self.state.clone(),
        }))
    }

    fn detokenize(&self, tokens: &[Token]) -> String {
        tokens.iter().filter_map(|t| char::from_u32(*t)).collect()
    }

    fn dispose(&self) -> BindingResult<()> {
        self.state.dispose(format!("model:{}", self.name))
    }
}

struct MockContext {
    state: Arc<MockRuntimeState>,
    name: String,
}

impl NativeContext for MockContext {
    fn create_session(&self) -> BindingResult<Box<dyn ChatSession>> {
        Ok(Box::new(MockSession {
            state: self.state.clone(),
        }))
    }

    fn dispose(&self) -> BindingResult<()> {
        self.state.dispose(format!("context:{}", self.name))
    }
}

struct MockSession {
    state: Arc<MockRuntimeState>,
}

#[async_trait]
impl ChatSession for MockSession {
    fn set_chat_history(&mut self, history: Vec<HistoryItem>) {
        self.state.histories.lock().push(history);
    }

    async fn prompt(
        &mut self,
        _text: &str,
        grammar: Option<&dyn Grammar>,
        cancel: &CancellationToken,
        on_tokens: &mut (dyn for<'t> FnMut(&'t [Token]) + Send),
    ) -> BindingResult<()> {
        self.state.prompts.fetch_add(1, Ordering::SeqCst);
        let reply = match grammar {
            Some(_) => r#"{"answer":42}"#.to_string(),
            None => self.state.reply.lock().clone(),
        };
        for c in reply.chars() {
            if cancel.is_cancelled() {
                break;
            }
            on_tokens(&[c as Token]);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

struct JsonGrammar;

impl Grammar for JsonGrammar {
    fn parse(&self, text: &str) -> BindingResult<serde_json::Value> {
        serde_json::from_str(text).map_err(|e| BindingError::new(e.to_string()))
    }
}

struct MockEmbedding {
    state: Arc<MockRuntimeState>,
}

#[async_trait]
impl EmbeddingContext for MockEmbedding {
    async fn embedding_for(&self, text: &str) -> BindingResult<Vec<f32>> {
        if self.state.fail_embedding.load(Ordering::SeqCst) {
            return Err(BindingError::new("embedding failed"));
        }
        Ok(vec![text.len() as f32, 0.5, 0.25])
    }

    fn dispose(&self) -> BindingResult<()> {
        self.state.disposals.lock().push("embedding".to_string());
        Ok(())
    }
}
