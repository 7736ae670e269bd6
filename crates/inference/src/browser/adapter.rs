//! In-browser engine adapter
//!
//! Owns at most one loaded [`WorkerEngine`]. Initialization is mutually
//! exclusive, probes the device's storage-buffer limit to pick a safe first
//! context window, steps the window down on limit errors without counting
//! them, and retries transient failures with backoff. Loading and generation
//! are canceled through independent tokens.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::engine::{
    BrowserEngineHost, CompletionRequest, EngineInitOptions, ProgressCallback, WorkerEngine,
};
use super::progress;
use crate::config::BrowserEngineConfig;
use crate::error::{ErrorCategory, InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::retry::{ensure_not_canceled, sleep_or_cancel, RetryPolicy, RetryState};
use crate::tools::{available_tools, supports_function_calling, ToolCallAccumulator, ToolExecutor};
use crate::types::{require_user_last, BackendKind, ChatMessage, ModelDescriptor, Role};

#[derive(Clone)]
struct LoadedEngine {
    model: String,
    context_window: u32,
    engine: Arc<dyn WorkerEngine>,
}

/// Clears the loading flag when an `initialize` call ends
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BrowserEngineAdapter {
    host: Arc<dyn BrowserEngineHost>,
    config: BrowserEngineConfig,
    policy: RetryPolicy,
    tools: Arc<dyn ToolExecutor>,
    events: EventBus,
    loading: AtomicBool,
    loaded: RwLock<Option<LoadedEngine>>,
    retry_state: Mutex<RetryState>,
    load_cancel: Mutex<CancellationToken>,
    generation_cancel: Mutex<CancellationToken>,
}

impl BrowserEngineAdapter {
    pub fn new(
        host: Arc<dyn BrowserEngineHost>,
        config: BrowserEngineConfig,
        policy: RetryPolicy,
        tools: Arc<dyn ToolExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            host,
            config,
            policy,
            tools,
            events,
            loading: AtomicBool::new(false),
            loaded: RwLock::new(None),
            retry_state: Mutex::new(RetryState::default()),
            load_cancel: Mutex::new(CancellationToken::new()),
            generation_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.host.prebuilt_models()
    }

    pub fn current_model(&self) -> Option<String> {
        self.loaded.read().as_ref().map(|l| l.model.clone())
    }

    /// Context window the resident engine was built with
    pub fn context_window(&self) -> Option<u32> {
        self.loaded.read().as_ref().map(|l| l.context_window)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry_state.lock().clone()
    }

    /// Load `model`, replacing any resident engine.
    pub async fn initialize(&self, model: &str) -> Result<()> {
        if !self.host.gpu_available() {
            return Err(InferenceError::CapabilityUnavailable(
                "WebGPU is not available in this environment".to_string(),
            ));
        }
        if self.loading.swap(true, Ordering::SeqCst) {
            return Err(InferenceError::AlreadyLoading);
        }
        let _guard = LoadingGuard(&self.loading);

        if self.current_model().as_deref() == Some(model) {
            log::debug!("Model {} already loaded", model);
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self.load_cancel.lock() = cancel.clone();
        *self.retry_state.lock() = RetryState::begin(model);

        self.unload().await;
        let result = self.load_with_retries(model, &cancel).await;
        self.retry_state.lock().reset();

        match &result {
            Ok(()) => self.events.emit(InferenceEvent::ModelLoaded {
                backend: BackendKind::BrowserEngine,
                model: model.to_string(),
            }),
            Err(err) if err.is_canceled() => log::info!("Loading of {} canceled", model),
            Err(err) => {
                log::error!("Failed to load {}: {}", model, err);
                self.events.emit(InferenceEvent::Error {
                    backend: BackendKind::BrowserEngine,
                    message: err.user_message(),
                });
            }
        }
        result
    }

    async fn load_with_retries(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        let requested = self.config.context_window_for(model);
        let limit = self.host.max_storage_buffers_per_shader_stage().await;
        let mut context_window = requested;
        if let Some(forced) = self.policy.anticipate(requested, limit) {
            log::warn!(
                "Device allows {:?} storage buffers per stage, starting with context window {} instead of {}",
                limit,
                forced,
                requested
            );
            context_window = forced;
            self.retry_state.lock().forced_context_window = Some(forced);
        }

        let mut retries = 0;
        loop {
            ensure_not_canceled(cancel)?;

            let err = match self.attempt(model, context_window, cancel).await {
                Ok(engine) => {
                    *self.loaded.write() = Some(LoadedEngine {
                        model: model.to_string(),
                        context_window,
                        engine,
                    });
                    log::info!("Loaded {} with context window {}", model, context_window);
                    return Ok(());
                }
                Err(err) => err,
            };

            if err.is_canceled() || cancel.is_cancelled() {
                return Err(InferenceError::Canceled);
            }

            if err.category() == ErrorCategory::ResourceLimit {
                match self.policy.step_down(context_window) {
                    Some(next) => {
                        log::warn!(
                            "Resource limit hit at context window {}, retrying with {}",
                            context_window,
                            next
                        );
                        context_window = next;
                        self.retry_state.lock().forced_context_window = Some(next);
                        continue;
                    }
                    None => return Err(err),
                }
            }

            if !err.is_retryable() {
                return Err(err);
            }
            if retries >= self.policy.max_retries {
                return Err(InferenceError::RetriesExhausted {
                    attempts: retries + 1,
                    source: Box::new(err),
                });
            }

            retries += 1;
            let delay = self.policy.backoff(retries);
            {
                let mut state = self.retry_state.lock();
                state.is_retrying = true;
                state.retry_count = retries;
            }
            log::warn!(
                "Loading {} failed ({}), retry {}/{} in {:?}",
                model,
                err,
                retries,
                self.policy.max_retries,
                delay
            );
            sleep_or_cancel(delay, cancel).await?;
        }
    }

    async fn attempt(
        &self,
        model: &str,
        context_window: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn WorkerEngine>> {
        let events = self.events.clone();
        let token = cancel.clone();
        let on_progress: ProgressCallback = Arc::new(move |report| {
            if token.is_cancelled() {
                return ControlFlow::Break(());
            }
            events.emit(InferenceEvent::InitProgress(progress::normalize(&report)));
            ControlFlow::Continue(())
        });

        let options = EngineInitOptions {
            context_window_size: context_window,
        };
        match self.host.create_engine(model, options, on_progress).await {
            Ok(engine) if cancel.is_cancelled() => {
                if let Err(e) = engine.unload().await {
                    log::warn!("Failed to unload canceled engine: {}", e);
                }
                Err(InferenceError::Canceled)
            }
            Ok(engine) => Ok(engine),
            Err(_) if cancel.is_cancelled() => Err(InferenceError::Canceled),
            Err(e) => Err(e.into()),
        }
    }

    /// Unload the resident engine, if any
    pub async fn unload(&self) {
        let Some(loaded) = self.loaded.write().take() else {
            return;
        };
        if let Err(e) = loaded.engine.unload().await {
            log::warn!("Failed to unload {}: {}", loaded.model, e);
        }
        self.events.emit(InferenceEvent::ModelUnloaded {
            backend: BackendKind::BrowserEngine,
            model: loaded.model,
        });
    }

    pub fn cancel_loading(&self) {
        self.load_cancel.lock().cancel();
    }

    pub fn cancel_generation(&self) {
        self.generation_cancel.lock().cancel();
        if let Some(loaded) = self.loaded.read().as_ref() {
            loaded.engine.interrupt();
        }
    }

    fn begin_generation(&self, messages: &[ChatMessage]) -> Result<(LoadedEngine, CancellationToken)> {
        require_user_last(messages)?;
        let loaded = self
            .loaded
            .read()
            .clone()
            .ok_or_else(|| InferenceError::precondition("No model loaded. Please load a model first."))?;

        let token = CancellationToken::new();
        *self.generation_cancel.lock() = token.clone();
        Ok((loaded, token))
    }

    fn prepare_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut prepared = Vec::with_capacity(messages.len() + 1);
        if messages.first().map(|m| m.role) != Some(Role::System) {
            prepared.push(ChatMessage::system(self.config.effective_system_prompt()));
        }
        prepared.extend_from_slice(messages);
        prepared
    }

    fn request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest {
            messages,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
            tools: None,
            stream: true,
        }
    }

    /// Stream a plain completion. Ends quietly when canceled.
    pub fn generate_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        let (loaded, cancel) = self.begin_generation(messages)?;
        let request = self.request(self.prepare_messages(messages));

        Ok(try_stream! {
            let mut deltas = loaded.engine.chat_completion_stream(request).await.map_err(InferenceError::from)?;
            while let Some(delta) = deltas.next().await {
                if cancel.is_cancelled() {
                    loaded.engine.interrupt();
                    break;
                }
                let delta = delta.map_err(InferenceError::from)?;
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    yield text;
                }
            }
        })
    }

    /// Stream a completion that may call tools, running up to
    /// `max_tool_rounds` model turns. Tools are only offered to models on
    /// the function-calling allow-list.
    pub fn generate_completion_with_tools(
        &self,
        messages: &[ChatMessage],
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        let (loaded, cancel) = self.begin_generation(messages)?;
        let mut base = self.request(self.prepare_messages(messages));
        if supports_function_calling(&loaded.model) {
            base.tools = Some(available_tools());
        } else {
            log::debug!("{} is not tool-capable, omitting tools", loaded.model);
        }
        let executor = self.tools.clone();
        let max_rounds = self.config.max_tool_rounds;

        Ok(try_stream! {
            let engine = loaded.engine;
            let offers_tools = base.tools.is_some();
            let mut conversation = std::mem::take(&mut base.messages);

            for round in 0..max_rounds {
                let request = CompletionRequest {
                    messages: conversation.clone(),
                    ..base.clone()
                };
                let mut accumulator = ToolCallAccumulator::new();
                let mut content = String::new();
                let mut fallback = false;

                match engine.chat_completion_stream(request.clone()).await {
                    Ok(mut deltas) => {
                        while let Some(delta) = deltas.next().await {
                            if cancel.is_cancelled() {
                                engine.interrupt();
                                return;
                            }
                            match delta {
                                Ok(delta) => {
                                    for fragment in &delta.tool_calls {
                                        accumulator.push(fragment);
                                    }
                                    if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                                        content.push_str(&text);
                                        yield text;
                                    }
                                }
                                Err(e) if offers_tools && content.is_empty() && accumulator.is_empty() => {
                                    log::warn!("Streaming with tools failed ({}), retrying without streaming", e);
                                    fallback = true;
                                    break;
                                }
                                Err(e) => Err::<(), _>(InferenceError::from(e))?,
                            }
                        }
                    }
                    Err(e) if offers_tools => {
                        log::warn!("Streaming with tools failed ({}), retrying without streaming", e);
                        fallback = true;
                    }
                    Err(e) => Err::<(), _>(InferenceError::from(e))?,
                }

                let calls = if fallback {
                    let response = engine
                        .chat_completion(CompletionRequest { stream: false, ..request })
                        .await
                        .map_err(InferenceError::from)?;
                    if !response.content.is_empty() {
                        content = response.content.clone();
                        yield response.content;
                    }
                    response.tool_calls
                } else {
                    accumulator.finish()
                };

                if calls.is_empty() {
                    return;
                }
                log::info!("Round {}: model requested {} tool call(s)", round + 1, calls.len());

                conversation.push(ChatMessage::assistant_tool_calls(content, calls.clone()));
                for call in &calls {
                    ensure_not_canceled(&cancel)?;
                    let result = executor.execute(call).await;
                    conversation.push(ChatMessage::tool_result(&result));
                }
            }
            log::warn!("Stopped tool loop after {} rounds", max_rounds);
        })
    }
}
