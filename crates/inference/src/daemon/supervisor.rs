//! Daemon process supervision
//!
//! Makes sure the model-serving daemon is reachable before any HTTP call is
//! made: adopts an already-running daemon, otherwise spawns one and polls
//! until it answers. Once ready, a background probe reports liveness on a
//! fixed interval independent of any request in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DaemonClient;
use crate::config::DaemonConfig;
use crate::error::{InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::process::{ProcessEvent, ProcessHandle, ProcessSpawner};
use crate::types::BackendKind;

/// Result of one liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    /// Probe round-trip (if successful)
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub consecutive_failures: u32,
}

struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    child: Option<Box<dyn ProcessHandle>>,
    health: Option<HealthTask>,
}

/// Supervisor for the daemon process
pub struct DaemonSupervisor {
    config: DaemonConfig,
    client: DaemonClient,
    spawner: Arc<dyn ProcessSpawner>,
    events: EventBus,
    state: Mutex<SupervisorState>,
    /// We spawned the running process and have not stopped it
    owns_process: Arc<AtomicBool>,
    last_result: Arc<RwLock<Option<HealthCheckResult>>>,
}

impl DaemonSupervisor {
    pub fn new(
        config: DaemonConfig,
        client: DaemonClient,
        spawner: Arc<dyn ProcessSpawner>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            client,
            spawner,
            events,
            state: Mutex::new(SupervisorState::default()),
            owns_process: Arc::new(AtomicBool::new(false)),
            last_result: Arc::new(RwLock::new(None)),
        }
    }

    pub fn client(&self) -> &DaemonClient {
        &self.client
    }

    /// Never fails; any probe failure reads as "not running".
    pub async fn is_running(&self) -> bool {
        self.client.is_running().await
    }

    pub fn owns_process(&self) -> bool {
        self.owns_process.load(Ordering::SeqCst)
    }

    pub async fn last_result(&self) -> Option<HealthCheckResult> {
        self.last_result.read().await.clone()
    }

    /// Ensure the daemon is running.
    ///
    /// A daemon that already answers is adopted as is. Otherwise the binary
    /// is spawned and probed every `startup_poll_interval` up to
    /// `startup_max_attempts` times. Spawn failures are reported as `Error`
    /// events; only the probe exhaustion fails this call.
    pub async fn start(&self) -> Result<()> {
        if self.client.is_running().await {
            log::info!("Daemon already running at {}", self.client.base_url());
            return Ok(());
        }

        let mut state = self.state.lock().await;

        match self.spawner.spawn(&self.config.binary, &self.config.args).await {
            Ok((rx, handle)) => {
                log::info!("Started daemon process {:?}", handle.pid());
                spawn_output_logger(rx);
                state.child = Some(handle);
                self.owns_process.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                log::error!("Failed to start daemon: {}", e);
                self.events.emit(InferenceEvent::Error {
                    backend: BackendKind::Daemon,
                    message: format!("Failed to start daemon: {}", e),
                });
            }
        }

        if let Err(e) = self.wait_for_ready().await {
            if let Some(child) = state.child.take() {
                log::warn!("Daemon never became ready, killing process {:?}", child.pid());
                if let Err(kill_err) = child.kill() {
                    log::warn!("Failed to kill daemon process: {}", kill_err);
                }
            }
            self.owns_process.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.events.emit(InferenceEvent::Ready {
            backend: BackendKind::Daemon,
        });

        if state.health.is_none() {
            state.health = Some(self.spawn_health_task());
        }
        Ok(())
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let attempts = self.config.startup_max_attempts;
        for attempt in 1..=attempts {
            if self.client.is_running().await {
                log::info!("Daemon ready after {} probe(s)", attempt);
                return Ok(());
            }
            tokio::time::sleep(self.config.startup_poll_interval).await;
        }
        log::error!("Daemon did not become ready after {} probes", attempts);
        Err(InferenceError::StartupTimeout { attempts })
    }

    fn spawn_health_task(&self) -> HealthTask {
        let cancel = CancellationToken::new();
        let client = self.client.clone();
        let events = self.events.clone();
        let owns_process = self.owns_process.clone();
        let last_result = self.last_result.clone();
        let interval = self.config.health_interval;
        let token = cancel.clone();

        log::info!(
            "Starting daemon health probe with {}ms interval",
            interval.as_millis()
        );

        let handle = tokio::spawn(async move {
            let mut consecutive_failures = 0u32;
            let mut previous_healthy = true;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let result = probe(&client, &mut consecutive_failures).await;
                if token.is_cancelled() {
                    break;
                }

                events.emit(InferenceEvent::Health {
                    running: result.healthy,
                });
                if !result.healthy && owns_process.load(Ordering::SeqCst) {
                    events.emit(InferenceEvent::Error {
                        backend: BackendKind::Daemon,
                        message: "Daemon stopped unexpectedly".to_string(),
                    });
                }
                if result.healthy != previous_healthy {
                    log::warn!(
                        "Daemon health changed: healthy={} (failures: {})",
                        result.healthy,
                        result.consecutive_failures
                    );
                }
                previous_healthy = result.healthy;
                *last_result.write().await = Some(result);
            }

            log::info!("Daemon health probe stopped");
        });

        HealthTask { cancel, handle }
    }

    /// Stop the health probe, then terminate the owned process. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        if let Some(task) = state.health.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        if let Some(child) = state.child.take() {
            log::info!("Stopping daemon process {:?}", child.pid());
            if let Err(e) = child.kill() {
                log::warn!("Failed to kill daemon process: {}", e);
            }
        }
        self.owns_process.store(false, Ordering::SeqCst);
    }
}

async fn probe(client: &DaemonClient, consecutive_failures: &mut u32) -> HealthCheckResult {
    let start = Instant::now();
    let healthy = client.is_running().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if healthy {
        *consecutive_failures = 0;
        HealthCheckResult {
            healthy,
            response_time_ms: Some(elapsed_ms),
            error: None,
            timestamp: Utc::now(),
            consecutive_failures: 0,
        }
    } else {
        *consecutive_failures += 1;
        HealthCheckResult {
            healthy,
            response_time_ms: None,
            error: Some("Daemon unreachable".to_string()),
            timestamp: Utc::now(),
            consecutive_failures: *consecutive_failures,
        }
    }
}

fn spawn_output_logger(mut rx: tokio::sync::mpsc::Receiver<ProcessEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Stdout(line) | ProcessEvent::Stderr(line) => {
                    log::debug!("[daemon] {}", String::from_utf8_lossy(&line));
                }
                ProcessEvent::Error(e) => log::warn!("[daemon] {}", e),
                ProcessEvent::Terminated(code) => {
                    log::warn!("Daemon process exited with {:?}", code);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::events::drain;

    #[derive(Default)]
    struct MockSpawner {
        spawns: AtomicUsize,
        kills: Arc<AtomicUsize>,
        fail: bool,
    }

    struct MockHandle {
        kills: Arc<AtomicUsize>,
    }

    impl ProcessHandle for MockHandle {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn kill(&self) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ProcessSpawner for MockSpawner {
        async fn spawn(
            &self,
            _program: &str,
            _args: &[String],
        ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>)> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InferenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "ollama not found",
                )));
            }
            let (_tx, rx) = mpsc::channel(1);
            Ok((
                rx,
                Box::new(MockHandle {
                    kills: self.kills.clone(),
                }),
            ))
        }
    }

    fn config_for(server: &MockServer) -> DaemonConfig {
        DaemonConfig {
            base_url: server.uri(),
            probe_timeout: Duration::from_millis(200),
            startup_poll_interval: Duration::from_millis(5),
            startup_max_attempts: 3,
            health_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn supervisor(config: DaemonConfig, spawner: Arc<MockSpawner>) -> (DaemonSupervisor, EventBus) {
        let events = EventBus::new();
        let client = DaemonClient::new(&config, events.clone());
        (
            DaemonSupervisor::new(config, client, spawner, events.clone()),
            events,
        )
    }

    async fn tags(server: &MockServer, status: u16, times: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({"models": []})));
        let mock = match times {
            Some(n) => mock.up_to_n_times(n),
            None => mock,
        };
        mock.mount(server).await;
    }

    #[tokio::test]
    async fn test_start_adopts_running_daemon() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        tags(&server, 200, None).await;
        let spawner = Arc::new(MockSpawner::default());
        let (supervisor, _) = supervisor(config_for(&server), spawner.clone());

        supervisor.start().await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 0);
        assert!(!supervisor.owns_process());
    }

    #[tokio::test]
    async fn test_start_spawns_and_waits_for_ready() {
        let server = MockServer::start().await;
        tags(&server, 503, Some(2)).await;
        tags(&server, 200, None).await;
        let spawner = Arc::new(MockSpawner::default());
        let (supervisor, events) = supervisor(config_for(&server), spawner.clone());
        let mut rx = events.subscribe();

        supervisor.start().await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
        assert!(supervisor.owns_process());
        assert!(drain(&mut rx).contains(&InferenceEvent::Ready {
            backend: BackendKind::Daemon
        }));

        supervisor.stop().await;
        assert_eq!(spawner.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let server = MockServer::start().await;
        tags(&server, 503, None).await;
        let spawner = Arc::new(MockSpawner::default());
        let (supervisor, _) = supervisor(config_for(&server), spawner.clone());

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, InferenceError::StartupTimeout { attempts: 3 }));
        assert_eq!(spawner.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.owns_process());

        // A second attempt does not leak the first child
        let _ = supervisor.start().await;
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(spawner.kills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_event() {
        let server = MockServer::start().await;
        tags(&server, 503, None).await;
        let spawner = Arc::new(MockSpawner {
            fail: true,
            ..Default::default()
        });
        let (supervisor, events) = supervisor(config_for(&server), spawner);
        let mut rx = events.subscribe();

        let _ = supervisor.start().await;
        let has_error = drain(&mut rx).iter().any(|e| {
            matches!(e, InferenceEvent::Error { message, .. } if message.contains("Failed to start daemon"))
        });
        assert!(has_error);
    }

    #[tokio::test]
    async fn test_health_probe_reports_crash_of_owned_process() {
        let server = MockServer::start().await;
        tags(&server, 503, Some(1)).await;
        tags(&server, 200, Some(1)).await;
        tags(&server, 503, None).await;
        let spawner = Arc::new(MockSpawner::default());
        let (supervisor, events) = supervisor(config_for(&server), spawner);
        let mut rx = events.subscribe();

        supervisor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        supervisor.stop().await;

        let received = drain(&mut rx);
        assert!(received.contains(&InferenceEvent::Health { running: false }));
        assert!(received.iter().any(|e| matches!(
            e,
            InferenceEvent::Error { message, .. } if message.contains("unexpectedly")
        )));
        let last = supervisor.last_result().await.unwrap();
        assert!(!last.healthy);
        assert!(last.consecutive_failures >= 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = MockServer::start().await;
        let spawner = Arc::new(MockSpawner::default());
        let (supervisor, _) = supervisor(config_for(&server), spawner.clone());
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(spawner.kills.load(Ordering::SeqCst), 0);
    }
}
