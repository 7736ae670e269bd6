//! Native runtime manager
//!
//! Owns the in-process runtime and the single resident model with its
//! context and chat session. Lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready      (x  NoModel <-> ModelLoaded)
//! any state     -> Disposed -> Initializing
//! ```
//!
//! All state sits behind one async mutex, so loads, unloads and chats are
//! strictly sequential. Handles never leave the manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::binding::{
    ChatSession, Grammar, HistoryItem, NativeContext, NativeModel, NativeRuntime,
    NativeRuntimeLoader, Token,
};
use super::options::{self, EnvLookup, GpuSetting, Platform, ResolvedOptions, SetOptions};
use crate::config::{HistoryReplay, NativeRuntimeConfig};
use crate::constants::native::MODEL_EXTENSION;
use crate::error::{InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::types::{require_user_last, BackendKind, ChatMessage, ModelDescriptor, ModelLocation, Role};

/// Runtime lifecycle as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

#[derive(Default)]
struct ManagerState {
    overrides: options::RuntimeOptions,
    resolved: Option<ResolvedOptions>,
    runtime: Option<Arc<dyn NativeRuntime>>,
    model: Option<Arc<dyn NativeModel>>,
    context: Option<Arc<dyn NativeContext>>,
    session: Option<Box<dyn ChatSession>>,
    current_path: Option<PathBuf>,
    disposed: bool,
}

/// Manager for the in-process native runtime
pub struct NativeRuntimeManager {
    loader: Arc<dyn NativeRuntimeLoader>,
    models_dir: PathBuf,
    history_replay: HistoryReplay,
    env: EnvLookup,
    platform: Platform,
    events: EventBus,
    state: Mutex<ManagerState>,
    lifecycle: RwLock<Lifecycle>,
}

impl NativeRuntimeManager {
    pub fn new(
        config: &NativeRuntimeConfig,
        loader: Arc<dyn NativeRuntimeLoader>,
        events: EventBus,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&config.models_dir) {
            log::warn!(
                "Could not create models directory {}: {}",
                config.models_dir.display(),
                e
            );
        }

        Self {
            loader,
            models_dir: config.models_dir.clone(),
            history_replay: config.history_replay,
            env: options::process_env(),
            platform: Platform::current(),
            events,
            state: Mutex::new(ManagerState {
                overrides: config.options.clone(),
                ..Default::default()
            }),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// Replace the environment lookup (tests, embedded hosts)
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write() = lifecycle;
    }

    // ─── Initialization ─────────────────────────────────────────────

    /// Load the runtime module. A no-op when already initialized unless
    /// `reinitialize` is set, in which case current state is disposed first.
    pub async fn initialize(&self, request: SetOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        state.overrides.merge(&request.options);
        if request.reinitialize && state.runtime.is_some() {
            self.dispose_locked(&mut state);
        }
        self.initialize_locked(&mut state).await
    }

    /// Merge overrides into the held configuration; rebuild the runtime
    /// when `reinitialize` is set.
    pub async fn set_options(&self, request: SetOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        state.overrides.merge(&request.options);
        if request.reinitialize {
            if state.runtime.is_some() || state.model.is_some() {
                self.dispose_locked(&mut state);
            }
            self.initialize_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Options the current runtime was built with
    pub async fn resolved_options(&self) -> Option<ResolvedOptions> {
        self.state.lock().await.resolved.clone()
    }

    async fn initialize_locked(&self, state: &mut ManagerState) -> Result<()> {
        state.disposed = false;
        if state.runtime.is_some() {
            return Ok(());
        }
        self.set_lifecycle(Lifecycle::Initializing);

        let supported = if options::requested_gpu(&state.overrides, &self.env) == GpuSetting::Auto {
            match self.loader.supported_gpu_backends().await {
                Ok(supported) => Some(supported),
                Err(e) => {
                    log::warn!("GPU detection failed, using CPU: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let resolved = options::resolve(&state.overrides, &self.env, self.platform, supported.as_deref());
        log::info!(
            "Initializing native runtime (gpu: {:?}, build: {:?}, debug: {}, threads: {:?})",
            resolved.gpu,
            resolved.build,
            resolved.debug,
            resolved.max_threads
        );

        match self.loader.load(&resolved).await {
            Ok(runtime) => {
                state.runtime = Some(runtime);
                state.resolved = Some(resolved);
                self.set_lifecycle(Lifecycle::Ready);
                self.events.emit(InferenceEvent::Ready {
                    backend: BackendKind::NativeRuntime,
                });
                Ok(())
            }
            Err(e) => {
                self.set_lifecycle(Lifecycle::Uninitialized);
                log::error!("Failed to load native runtime: {}", e);
                Err(e.into())
            }
        }
    }

    // ─── Models ─────────────────────────────────────────────────────

    pub fn models_directory(&self) -> &Path {
        &self.models_dir
    }

    pub async fn current_model(&self) -> Option<PathBuf> {
        self.state.lock().await.current_path.clone()
    }

    pub async fn is_model_loaded(&self) -> bool {
        let state = self.state.lock().await;
        !state.disposed && state.model.is_some() && state.session.is_some()
    }

    /// GGUF files in the models directory, sorted by name
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut models = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            models.push(ModelDescriptor {
                display_name: name.trim_end_matches(".gguf").to_string(),
                name,
                size_bytes: metadata.len(),
                location: ModelLocation::File { path },
            });
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Make `path` the resident model.
    ///
    /// Loading the already-resident path is a no-op. A disposal error on the
    /// first attempt triggers exactly one reinitialize-and-retry.
    pub async fn load_model(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.disposed {
            log::warn!("Native runtime is disposed, reinitializing");
        }
        self.initialize_locked(&mut state).await?;

        if state.current_path.as_deref() == Some(path) && state.model.is_some() {
            log::debug!("Model {} already loaded", path.display());
            return Ok(());
        }

        match self.try_load(&mut state, path).await {
            Err(InferenceError::HandleDisposed(message)) => {
                log::warn!("Load hit a disposed handle ({}), reinitializing once", message);
                self.dispose_locked(&mut state);
                self.initialize_locked(&mut state).await?;
                self.try_load(&mut state, path).await
            }
            other => other,
        }
    }

    async fn try_load(&self, state: &mut ManagerState, path: &Path) -> Result<()> {
        self.unload_locked(state);

        let runtime = state
            .runtime
            .clone()
            .ok_or_else(|| InferenceError::precondition("Native runtime is not initialized"))?;

        log::info!("Loading native model {}", path.display());
        let model = runtime.load_model(path).await?;
        let context = match model.create_context().await {
            Ok(context) => context,
            Err(e) => {
                let _ = model.dispose();
                return Err(e.into());
            }
        };
        let session = match context.create_session() {
            Ok(session) => session,
            Err(e) => {
                let _ = context.dispose();
                let _ = model.dispose();
                return Err(e.into());
            }
        };

        state.model = Some(model);
        state.context = Some(context);
        state.session = Some(session);
        state.current_path = Some(path.to_path_buf());

        self.events.emit(InferenceEvent::ModelLoaded {
            backend: BackendKind::NativeRuntime,
            model: path.display().to_string(),
        });
        Ok(())
    }

    /// Drop the resident model. Disposal errors are logged, never returned.
    pub async fn unload_model(&self) {
        let mut state = self.state.lock().await;
        self.unload_locked(&mut state);
    }

    fn unload_locked(&self, state: &mut ManagerState) {
        state.session = None;
        // Context depends on the model; release it first
        if let Some(context) = state.context.take() {
            if let Err(e) = context.dispose() {
                log::warn!("Error disposing context: {}", e);
            }
        }
        if let Some(model) = state.model.take() {
            if let Err(e) = model.dispose() {
                log::warn!("Error disposing model: {}", e);
            }
        }
        if let Some(path) = state.current_path.take() {
            log::info!("Unloaded native model {}", path.display());
            self.events.emit(InferenceEvent::ModelUnloaded {
                backend: BackendKind::NativeRuntime,
                model: path.display().to_string(),
            });
        }
    }

    /// Tear down model and runtime. The next load reinitializes.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        self.dispose_locked(&mut state);
    }

    fn dispose_locked(&self, state: &mut ManagerState) {
        self.unload_locked(state);
        if let Some(runtime) = state.runtime.take() {
            if let Err(e) = runtime.dispose() {
                log::warn!("Error disposing native runtime: {}", e);
            }
        }
        state.resolved = None;
        state.disposed = true;
        self.set_lifecycle(Lifecycle::Disposed);
        self.events.emit(InferenceEvent::Disposed);
    }

    // ─── Generation ─────────────────────────────────────────────────

    /// Replay the history into the session and prompt with the final user
    /// turn. `on_token` sees each detokenized fragment.
    pub async fn chat<F>(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
        on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let mut state = self.state.lock().await;
        self.generate(&mut state, messages, None, cancel, on_token).await
    }

    /// Like [`chat`](Self::chat), constrained by a grammar compiled from
    /// `schema`. Returns the parsed value.
    pub async fn chat_with_schema<F>(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        cancel: &CancellationToken,
        on_token: F,
    ) -> Result<serde_json::Value>
    where
        F: FnMut(&str) + Send,
    {
        let mut state = self.state.lock().await;
        ensure_loaded(&state)?;
        require_user_last(messages)?;

        let runtime = state
            .runtime
            .clone()
            .ok_or_else(|| InferenceError::precondition("Native runtime is not initialized"))?;
        let grammar = runtime
            .create_grammar_for_json_schema(schema)
            .await
            .map_err(disposed_hint)?;

        let text = self
            .generate(&mut state, messages, Some(grammar.as_ref()), cancel, on_token)
            .await?;
        grammar.parse(&text).map_err(|e| {
            InferenceError::Serialization(serde::de::Error::custom(format!(
                "Output did not match schema: {}",
                e
            )))
        })
    }

    async fn generate<F>(
        &self,
        state: &mut ManagerState,
        messages: &[ChatMessage],
        grammar: Option<&dyn Grammar>,
        cancel: &CancellationToken,
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        ensure_loaded(state)?;
        let last = require_user_last(messages)?;
        let prior = &messages[..messages.len() - 1];
        let history = replay_history(prior, self.history_replay);

        let model = state
            .model
            .clone()
            .ok_or_else(|| InferenceError::precondition("No model loaded. Please load a model first."))?;
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| InferenceError::precondition("No model loaded. Please load a model first."))?;

        session.set_chat_history(history);

        let mut full = String::new();
        let mut relay = |tokens: &[Token]| {
            let fragment = model.detokenize(tokens);
            if !fragment.is_empty() {
                full.push_str(&fragment);
                on_token(&fragment);
            }
        };
        session
            .prompt(&last.text(), grammar, cancel, &mut relay)
            .await
            .map_err(disposed_hint)?;

        if cancel.is_cancelled() {
            return Err(InferenceError::Canceled);
        }
        Ok(full)
    }

    /// Compute an embedding in a context scoped to this call
    pub async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let state = self.state.lock().await;
        let model = match (&state.model, state.disposed) {
            (Some(model), false) => model.clone(),
            _ => return Err(InferenceError::precondition("No model loaded. Please load a model first.")),
        };

        let context = model.create_embedding_context().await.map_err(disposed_hint)?;
        let result = context.embedding_for(text).await;
        if let Err(e) = context.dispose() {
            log::warn!("Error disposing embedding context: {}", e);
        }
        result.map_err(disposed_hint)
    }
}

fn ensure_loaded(state: &ManagerState) -> Result<()> {
    if state.disposed || state.session.is_none() || state.model.is_none() {
        Err(InferenceError::precondition(
            "No model loaded. Please load a model first.",
        ))
    } else {
        Ok(())
    }
}

/// Disposal during generation means the caller must reload
fn disposed_hint(err: super::binding::BindingError) -> InferenceError {
    if err.is_disposed() {
        InferenceError::HandleDisposed(format!(
            "Model context was disposed. Please reload the model. ({})",
            err
        ))
    } else {
        err.into()
    }
}

fn replay_history(prior: &[ChatMessage], mode: HistoryReplay) -> Vec<HistoryItem> {
    prior
        .iter()
        .filter_map(|message| match message.role {
            Role::System => Some(HistoryItem::System(message.text())),
            Role::User => Some(HistoryItem::User(message.text())),
            Role::Assistant => match mode {
                HistoryReplay::Full => Some(HistoryItem::Model(message.text())),
                HistoryReplay::ExcludeAssistant => None,
            },
            // Tool turns are not part of native sessions
            Role::Tool => None,
        })
        .collect()
}
