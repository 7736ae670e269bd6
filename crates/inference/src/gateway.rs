//! Inference Gateway - Single entry point for all inference operations
//!
//! The gateway keeps exactly one selected backend, persisted across
//! sessions, and forwards every call to it. Switching backends does not
//! unload anything on the previous one; each backend owns its resident
//! model. The gateway's own guarantee is that generations never overlap:
//! starting a chat or a load first cancels the running generation and waits
//! for it to finish.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};

use crate::backend::{
    BackendCapabilities, BackendInfo, BackendRegistry, BrowserBackend, DaemonBackend,
    InferenceBackend, NativeBackend,
};
use crate::browser::{BrowserEngineAdapter, BrowserEngineHost};
use crate::config::{InferenceConfig, Settings};
use crate::daemon::{DaemonClient, DaemonSupervisor};
use crate::error::{InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::native::binding::NativeRuntimeLoader;
use crate::native::{DownloadOutcome, ModelDownloader, NativeRuntimeManager, SetOptions};
use crate::process::ProcessSpawner;
use crate::tools::{BuiltinToolExecutor, WebSearch};
use crate::types::{BackendKind, ChatMessage, ModelDescriptor};

/// External collaborators the gateway assembles backends from. A backend
/// is only registered when its collaborator is present.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub browser_host: Option<Arc<dyn BrowserEngineHost>>,
    pub native_loader: Option<Arc<dyn NativeRuntimeLoader>>,
    pub spawner: Option<Arc<dyn ProcessSpawner>>,
    pub web_search: Option<Arc<dyn WebSearch>>,
}

/// Generation currently running through the gateway
struct Turn {
    backend: Arc<dyn InferenceBackend>,
    canceled: Arc<AtomicBool>,
}

/// Clears the active turn when the generation that set it ends
struct TurnGuard<'a> {
    active: &'a Mutex<Option<Turn>>,
    canceled: Arc<AtomicBool>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active
            .as_ref()
            .is_some_and(|turn| Arc::ptr_eq(&turn.canceled, &self.canceled))
        {
            *active = None;
        }
    }
}

/// The single entry point for ALL inference operations.
///
/// Application code should only interact with InferenceGateway, never
/// with backends directly.
pub struct InferenceGateway {
    registry: BackendRegistry,
    selected: RwLock<BackendKind>,
    settings: Mutex<Settings>,
    settings_path: Option<PathBuf>,
    events: EventBus,
    active: Mutex<Option<Turn>>,
    /// Held for the whole of a chat or load
    turn_lock: tokio::sync::Mutex<()>,
    daemon: Option<Arc<DaemonBackend>>,
    native: Option<Arc<NativeBackend>>,
}

impl InferenceGateway {
    /// Create a gateway over already constructed backends.
    ///
    /// The selection comes from the settings file when it names a registered
    /// backend, otherwise from the host default.
    pub fn new(
        registry: BackendRegistry,
        events: EventBus,
        settings_path: Option<PathBuf>,
        desktop_host: bool,
    ) -> Self {
        let settings = settings_path
            .as_deref()
            .map(Settings::load)
            .unwrap_or_default();
        let selected = settings
            .selected_backend
            .filter(|kind| registry.is_registered(*kind))
            .unwrap_or_else(|| BackendKind::default_for_host(desktop_host));
        log::info!("Selected backend: {}", selected);

        Self {
            registry,
            selected: RwLock::new(selected),
            settings: Mutex::new(settings),
            settings_path,
            events,
            active: Mutex::new(None),
            turn_lock: tokio::sync::Mutex::new(()),
            daemon: None,
            native: None,
        }
    }

    /// Assemble every backend whose collaborator is provided
    pub fn from_config(
        config: &InferenceConfig,
        collaborators: Collaborators,
        settings_path: Option<PathBuf>,
    ) -> Self {
        let events = EventBus::new();
        let mut registry = BackendRegistry::new();

        if let Some(host) = collaborators.browser_host {
            let tools = Arc::new(BuiltinToolExecutor::new(collaborators.web_search.clone()));
            let adapter = BrowserEngineAdapter::new(
                host,
                config.browser.clone(),
                config.retry.clone(),
                tools,
                events.clone(),
            );
            registry.register(Arc::new(BrowserBackend::new(Arc::new(adapter))));
        }

        let daemon = collaborators.spawner.map(|spawner| {
            let client = DaemonClient::new(&config.daemon, events.clone());
            let supervisor =
                DaemonSupervisor::new(config.daemon.clone(), client, spawner, events.clone());
            Arc::new(DaemonBackend::new(
                Arc::new(supervisor),
                config.daemon.binary.clone(),
                events.clone(),
            ))
        });
        if let Some(daemon) = &daemon {
            registry.register(daemon.clone());
        }

        let native = collaborators.native_loader.map(|loader| {
            let manager = NativeRuntimeManager::new(&config.native, loader, events.clone());
            let downloader = ModelDownloader::new(config.native.models_dir.clone(), events.clone());
            Arc::new(NativeBackend::new(Arc::new(manager), downloader))
        });
        if let Some(native) = &native {
            registry.register(native.clone());
        }

        let mut gateway = Self::new(registry, events, settings_path, config.desktop_host);
        gateway.daemon = daemon;
        gateway.native = native;
        gateway
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InferenceEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub async fn selected_backend(&self) -> BackendKind {
        *self.selected.read().await
    }

    /// The selected backend instance
    pub async fn backend(&self) -> Result<Arc<dyn InferenceBackend>> {
        self.registry.get(self.selected_backend().await)
    }

    /// List all registered backends with their info
    pub async fn available_backends(&self) -> Vec<BackendInfo> {
        self.registry.list(self.selected_backend().await)
    }

    pub async fn capabilities(&self) -> Result<BackendCapabilities> {
        Ok(self.backend().await?.capabilities())
    }

    /// Select a different backend and persist the choice.
    ///
    /// The previous backend keeps whatever model it has loaded.
    pub async fn switch_backend(&self, kind: BackendKind) -> Result<()> {
        self.registry.get(kind)?;
        self.cancel_generation();

        {
            let mut selected = self.selected.write().await;
            if *selected == kind {
                return Ok(());
            }
            *selected = kind;
        }
        self.settings.lock().selected_backend = Some(kind);
        self.persist();

        log::info!("Switched to backend: {}", kind);
        self.events.emit(InferenceEvent::BackendSwitched { backend: kind });
        Ok(())
    }

    /// Last model selected on `kind`, if any
    pub fn remembered_model(&self, kind: BackendKind) -> Option<String> {
        self.settings.lock().selected_models.get(&kind).cloned()
    }

    fn persist(&self) {
        let Some(path) = &self.settings_path else {
            return;
        };
        let settings = self.settings.lock().clone();
        if let Err(e) = settings.save(path) {
            log::warn!("Failed to save settings to {}: {}", path.display(), e);
        }
    }

    // ─── LIFECYCLE METHODS ──────────────────────────────────────────

    /// Start the selected backend
    pub async fn start(&self) -> Result<()> {
        self.backend().await?.start().await
    }

    /// Stop every backend
    pub async fn stop(&self) {
        self.cancel_generation();
        for backend in self.registry.all() {
            backend.stop().await;
        }
    }

    // ─── MODELS ─────────────────────────────────────────────────────

    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.backend().await?.list_models().await
    }

    /// Load (or, for the daemon, select) a model on the selected backend
    pub async fn load_model(&self, model: &str) -> Result<()> {
        let backend = self.backend().await?;
        self.cancel_generation();
        let _permit = self.turn_lock.lock().await;

        backend.load_model(model).await?;
        self.settings
            .lock()
            .selected_models
            .insert(backend.kind(), model.to_string());
        self.persist();
        Ok(())
    }

    pub async fn set_model(&self, model: &str) -> Result<()> {
        self.load_model(model).await
    }

    pub async fn unload_model(&self) -> Result<()> {
        self.backend().await?.unload_model().await
    }

    pub async fn current_model(&self) -> Option<String> {
        match self.backend().await {
            Ok(backend) => backend.current_model().await,
            Err(_) => None,
        }
    }

    // ─── INFERENCE METHODS ──────────────────────────────────────────

    /// Run one conversation turn on the selected backend.
    ///
    /// Each delta is published as a `ChatToken` event; the concatenated
    /// reply is returned. A running generation is canceled first. Returns
    /// `Canceled` if this turn is canceled before it completes.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let backend = self.backend().await?;
        let kind = backend.kind();

        self.cancel_generation();
        let _permit = self.turn_lock.lock().await;
        let (canceled, _guard) = self.begin_turn(&backend);

        let mut stream = backend.chat_stream(messages).await?;
        let mut full = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            self.events.emit(InferenceEvent::ChatToken {
                backend: kind,
                text: token.clone(),
            });
            full.push_str(&token);
        }

        if canceled.load(Ordering::SeqCst) {
            log::info!("Generation on {} canceled", kind);
            return Err(InferenceError::Canceled);
        }
        Ok(full)
    }

    pub async fn chat_with_schema(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let backend = self.backend().await?;
        self.cancel_generation();
        let _permit = self.turn_lock.lock().await;
        let (canceled, _guard) = self.begin_turn(&backend);

        let result = backend.chat_with_schema(messages, schema).await;
        if canceled.load(Ordering::SeqCst) {
            log::info!("Structured generation on {} canceled", backend.kind());
            return Err(InferenceError::Canceled);
        }
        result
    }

    /// Mark a generation on `backend` as the active turn until the guard drops
    fn begin_turn(&self, backend: &Arc<dyn InferenceBackend>) -> (Arc<AtomicBool>, TurnGuard<'_>) {
        let canceled = Arc::new(AtomicBool::new(false));
        *self.active.lock() = Some(Turn {
            backend: backend.clone(),
            canceled: canceled.clone(),
        });
        let guard = TurnGuard {
            active: &self.active,
            canceled: canceled.clone(),
        };
        (canceled, guard)
    }

    pub async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.backend().await?.embed(text).await
    }

    /// Abort a load in progress on the selected backend
    pub async fn cancel_loading(&self) {
        if let Ok(backend) = self.backend().await {
            backend.cancel_loading();
        }
    }

    // ─── DAEMON MODEL MANAGEMENT ────────────────────────────────────

    fn daemon(&self) -> Result<&Arc<DaemonBackend>> {
        self.daemon
            .as_ref()
            .ok_or_else(|| not_configured(BackendKind::Daemon))
    }

    /// Pull a model through the daemon, emitting `PullProgress` events
    pub async fn pull_model(&self, name: &str) -> Result<()> {
        self.daemon()?.supervisor().client().pull_model(name).await
    }

    pub async fn delete_model(&self, name: &str) -> Result<()> {
        self.daemon()?.supervisor().client().delete_model(name).await
    }

    pub async fn show_model_info(&self, name: &str) -> Result<serde_json::Value> {
        self.daemon()?.supervisor().client().show_model_info(name).await
    }

    // ─── NATIVE RUNTIME ─────────────────────────────────────────────

    fn native(&self) -> Result<&Arc<NativeBackend>> {
        self.native
            .as_ref()
            .ok_or_else(|| not_configured(BackendKind::NativeRuntime))
    }

    /// Initialize the native runtime with explicit overrides
    pub async fn initialize_native(&self, request: SetOptions) -> Result<()> {
        self.native()?.manager().initialize(request).await
    }

    pub async fn set_native_options(&self, request: SetOptions) -> Result<()> {
        self.native()?.manager().set_options(request).await
    }

    pub fn models_directory(&self) -> Result<PathBuf> {
        Ok(self.native()?.manager().models_directory().to_path_buf())
    }

    /// Download a model file into the models directory, emitting
    /// `DownloadProgress` events. Download failures are reported in the
    /// outcome.
    pub async fn download_model(&self, url: &str, filename: &str) -> Result<DownloadOutcome> {
        Ok(self.native()?.downloader().download(url, filename).await)
    }

    /// Abort the running generation. Safe when nothing is running.
    pub fn cancel_generation(&self) {
        if let Some(turn) = self.active.lock().as_ref() {
            turn.canceled.store(true, Ordering::SeqCst);
            turn.backend.cancel_generation();
        }
    }
}

fn not_configured(kind: BackendKind) -> InferenceError {
    InferenceError::precondition(format!("Backend {} is not configured", kind))
}

/// Shared gateway type for application state
pub type SharedGateway = Arc<InferenceGateway>;

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::backend::{until_canceled, ChatStream};
    use crate::config::{DaemonConfig, NativeRuntimeConfig};
    use crate::events::drain;
    use crate::native::mock::MockLoader;
    use crate::process::{ProcessEvent, ProcessHandle};
    use crate::types::require_user_last;

    /// Backend replaying scripted replies; a hanging reply never ends
    /// until canceled
    struct ScriptedBackend {
        kind: BackendKind,
        replies: Mutex<VecDeque<(Vec<&'static str>, bool)>>,
        generation: Mutex<CancellationToken>,
        calls: AtomicUsize,
        model: Mutex<Option<String>>,
        schema_started: Notify,
    }

    impl ScriptedBackend {
        fn new(kind: BackendKind, replies: Vec<(Vec<&'static str>, bool)>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                replies: Mutex::new(replies.into()),
                generation: Mutex::new(CancellationToken::new()),
                calls: AtomicUsize::new(0),
                model: Mutex::new(None),
                schema_started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn description(&self) -> &'static str {
            "scripted test backend"
        }
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
            Ok(Vec::new())
        }
        async fn load_model(&self, model: &str) -> Result<()> {
            *self.model.lock() = Some(model.to_string());
            Ok(())
        }
        async fn unload_model(&self) -> Result<()> {
            *self.model.lock() = None;
            Ok(())
        }
        async fn current_model(&self) -> Option<String> {
            self.model.lock().clone()
        }
        async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
            require_user_last(messages)?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = CancellationToken::new();
            *self.generation.lock() = token.clone();

            let (tokens, hang) = self.replies.lock().pop_front().unwrap_or_default();
            let tokens = futures_util::stream::iter(tokens.into_iter().map(|t| Ok(t.to_string())));
            let stream: ChatStream = if hang {
                Box::pin(tokens.chain(futures_util::stream::pending()))
            } else {
                Box::pin(tokens)
            };
            Ok(until_canceled(stream, token))
        }
        /// Runs until canceled
        async fn chat_with_schema(
            &self,
            messages: &[ChatMessage],
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            require_user_last(messages)?;
            let token = CancellationToken::new();
            *self.generation.lock() = token.clone();
            self.schema_started.notify_one();
            token.cancelled().await;
            Err(InferenceError::Canceled)
        }
        fn cancel_generation(&self) {
            self.generation.lock().cancel();
        }
    }

    fn gateway_with(
        backends: &[Arc<ScriptedBackend>],
        settings_path: Option<PathBuf>,
        desktop_host: bool,
    ) -> Arc<InferenceGateway> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.register(backend.clone());
        }
        Arc::new(InferenceGateway::new(
            registry,
            EventBus::new(),
            settings_path,
            desktop_host,
        ))
    }

    async fn wait_for_token(rx: &mut broadcast::Receiver<InferenceEvent>) {
        loop {
            if let Ok(InferenceEvent::ChatToken { .. }) = rx.recv().await {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_default_selection_follows_host() {
        let desktop = gateway_with(&[], None, true);
        assert_eq!(desktop.selected_backend().await, BackendKind::Daemon);
        let web = gateway_with(&[], None, false);
        assert_eq!(web.selected_backend().await, BackendKind::BrowserEngine);
    }

    #[tokio::test]
    async fn test_selection_persists_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let backends = || {
            [
                ScriptedBackend::new(BackendKind::Daemon, Vec::new()),
                ScriptedBackend::new(BackendKind::NativeRuntime, Vec::new()),
            ]
        };

        let gateway = gateway_with(&backends(), Some(path.clone()), true);
        let mut rx = gateway.subscribe();
        gateway.switch_backend(BackendKind::NativeRuntime).await.unwrap();
        gateway.load_model("b.gguf").await.unwrap();
        assert!(drain(&mut rx).contains(&InferenceEvent::BackendSwitched {
            backend: BackendKind::NativeRuntime
        }));

        let reopened = gateway_with(&backends(), Some(path), true);
        assert_eq!(reopened.selected_backend().await, BackendKind::NativeRuntime);
        assert_eq!(
            reopened.remembered_model(BackendKind::NativeRuntime).as_deref(),
            Some("b.gguf")
        );
    }

    #[tokio::test]
    async fn test_switch_to_unregistered_backend_fails() {
        let gateway = gateway_with(
            &[ScriptedBackend::new(BackendKind::Daemon, Vec::new())],
            None,
            true,
        );
        let err = gateway
            .switch_backend(BackendKind::BrowserEngine)
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Precondition);
        assert_eq!(gateway.selected_backend().await, BackendKind::Daemon);
        assert_eq!(gateway.available_backends().await.len(), 1);
        assert!(gateway.available_backends().await[0].active);
    }

    #[tokio::test]
    async fn test_chat_relays_tokens() {
        let backend = ScriptedBackend::new(BackendKind::Daemon, vec![(vec!["Hel", "lo"], false)]);
        let gateway = gateway_with(&[backend.clone()], None, true);
        let mut rx = gateway.subscribe();

        let reply = gateway.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply, "Hello");
        let tokens: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                InferenceEvent::ChatToken { backend: BackendKind::Daemon, text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_cancel_generation_reports_canceled() {
        let backend = ScriptedBackend::new(BackendKind::Daemon, vec![(vec!["partial"], true)]);
        let gateway = gateway_with(&[backend], None, true);
        let mut rx = gateway.subscribe();

        let chat = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.chat(&[ChatMessage::user("hi")]).await }
        });
        wait_for_token(&mut rx).await;
        gateway.cancel_generation();

        let result = chat.await.unwrap();
        assert!(matches!(result, Err(InferenceError::Canceled)));
        assert!(result.unwrap_err().user_message() == "Stopped.");

        // Nothing running: still safe
        gateway.cancel_generation();
    }

    #[tokio::test]
    async fn test_new_turn_cancels_previous() {
        let backend = ScriptedBackend::new(
            BackendKind::Daemon,
            vec![(vec!["first"], true), (vec!["second"], false)],
        );
        let gateway = gateway_with(&[backend.clone()], None, true);
        let mut rx = gateway.subscribe();

        let first = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.chat(&[ChatMessage::user("one")]).await }
        });
        wait_for_token(&mut rx).await;

        let second = gateway.chat(&[ChatMessage::user("two")]).await.unwrap();
        assert_eq!(second, "second");
        assert!(matches!(first.await.unwrap(), Err(InferenceError::Canceled)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    fn spawn_schema(gateway: &Arc<InferenceGateway>) -> tokio::task::JoinHandle<Result<serde_json::Value>> {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .chat_with_schema(&[ChatMessage::user("hi")], &serde_json::json!({"type": "object"}))
                .await
        })
    }

    #[tokio::test]
    async fn test_cancel_generation_stops_structured_output() {
        let backend = ScriptedBackend::new(BackendKind::Daemon, Vec::new());
        let gateway = gateway_with(&[backend.clone()], None, true);

        let schema = spawn_schema(&gateway);
        backend.schema_started.notified().await;
        gateway.cancel_generation();

        let result = tokio::time::timeout(Duration::from_secs(2), schema)
            .await
            .expect("structured generation stops once canceled")
            .unwrap();
        assert!(matches!(result, Err(InferenceError::Canceled)));
    }

    #[tokio::test]
    async fn test_chat_cancels_running_structured_output() {
        let backend = ScriptedBackend::new(BackendKind::Daemon, vec![(vec!["ok"], false)]);
        let gateway = gateway_with(&[backend.clone()], None, true);

        let schema = spawn_schema(&gateway);
        backend.schema_started.notified().await;

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            gateway.chat(&[ChatMessage::user("next")]),
        )
        .await
        .expect("chat is not blocked behind the structured generation")
        .unwrap();
        assert_eq!(reply, "ok");
        assert!(matches!(schema.await.unwrap(), Err(InferenceError::Canceled)));
    }

    struct IdleSpawner;

    #[async_trait]
    impl ProcessSpawner for IdleSpawner {
        async fn spawn(
            &self,
            program: &str,
            _args: &[String],
        ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>)> {
            Err(InferenceError::precondition(format!("not spawning {}", program)))
        }
    }

    #[tokio::test]
    async fn test_model_management_through_configured_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"status\":\"pulling abc\",\"total\":10,\"completed\":5}\n{\"status\":\"success\"}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/delete"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/show"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"template": "{{ .Prompt }}"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/small.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let loader = MockLoader::new();
        let state = loader.state.clone();
        let config = InferenceConfig {
            daemon: DaemonConfig {
                base_url: server.uri(),
                ..Default::default()
            },
            native: NativeRuntimeConfig {
                models_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let gateway = InferenceGateway::from_config(
            &config,
            Collaborators {
                native_loader: Some(Arc::new(loader)),
                spawner: Some(Arc::new(IdleSpawner)),
                ..Default::default()
            },
            None,
        );
        let mut rx = gateway.subscribe();

        gateway.pull_model("llama3.2").await.unwrap();
        gateway.delete_model("llama3.2").await.unwrap();
        let info = gateway.show_model_info("llama3.2").await.unwrap();
        assert_eq!(info["template"], "{{ .Prompt }}");

        assert_eq!(gateway.models_directory().unwrap(), dir.path());
        gateway
            .set_native_options(SetOptions {
                reinitialize: true,
                ..Default::default()
            })
            .await
            .unwrap();
        gateway.initialize_native(SetOptions::default()).await.unwrap();
        assert_eq!(state.runtime_loads.load(Ordering::SeqCst), 1);

        let outcome = gateway
            .download_model(&format!("{}/files/small.gguf", server.uri()), "small.gguf")
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(dir.path().join("small.gguf").exists());

        let received = drain(&mut rx);
        assert!(received.iter().any(|e| matches!(
            e,
            InferenceEvent::PullProgress(p) if p.model == "llama3.2" && p.total == 10
        )));
        assert!(received.iter().any(|e| matches!(
            e,
            InferenceEvent::DownloadProgress(p) if p.filename == "small.gguf" && p.percent == 100
        )));
    }

    #[tokio::test]
    async fn test_model_management_requires_configured_backend() {
        let gateway = gateway_with(&[], None, true);
        let err = gateway.pull_model("llama3.2").await.unwrap_err();
        assert!(err.to_string().contains("daemon is not configured"));
        assert!(gateway.models_directory().is_err());
    }

    #[tokio::test]
    async fn test_native_chat_requires_model_and_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        let loader = MockLoader::new();
        let state = loader.state.clone();
        let config = InferenceConfig {
            native: NativeRuntimeConfig {
                models_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        let gateway = InferenceGateway::from_config(
            &config,
            Collaborators {
                native_loader: Some(Arc::new(loader)),
                ..Default::default()
            },
            None,
        );
        gateway.switch_backend(BackendKind::NativeRuntime).await.unwrap();
        gateway.start().await.unwrap();

        let err = gateway.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("No model loaded"));

        gateway.load_model("a.gguf").await.unwrap();
        let err = gateway
            .chat(&[ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Precondition);
        assert_eq!(state.prompts.load(Ordering::SeqCst), 0);

        let reply = gateway.chat(&[ChatMessage::user("hi")]).await.unwrap();
        assert_eq!(reply, "Hello world");
        assert!(gateway.current_model().await.unwrap().ends_with("a.gguf"));
    }
}
