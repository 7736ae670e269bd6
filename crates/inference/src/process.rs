//! Process spawning abstraction
//!
//! The daemon supervisor never touches `tokio::process` directly; it goes
//! through [`ProcessSpawner`] so a desktop host can hand in its own
//! sidecar mechanism and tests can hand in a mock.
//!
//! # Example
//!
//! ```rust,ignore
//! use inference::process::{ProcessEvent, ProcessSpawner, StdProcessSpawner};
//!
//! let spawner = StdProcessSpawner::new();
//! let (mut rx, handle) = spawner.spawn("ollama", &["serve".to_string()]).await?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         ProcessEvent::Stderr(data) => eprintln!("{}", String::from_utf8_lossy(&data)),
//!         ProcessEvent::Terminated(code) => break,
//!         _ => {}
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Output event from a spawned process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Line written to stdout
    Stdout(Vec<u8>),
    /// Line written to stderr
    Stderr(Vec<u8>),
    /// Process error (e.g., wait failed)
    Error(String),
    /// Process terminated with optional exit code
    Terminated(Option<i32>),
}

/// Handle to a spawned process
pub trait ProcessHandle: Send + Sync {
    /// Process ID, if the OS reported one
    fn pid(&self) -> Option<u32>;
    /// Request termination. Killing an exited process is not an error.
    fn kill(&self) -> Result<()>;
}

/// Trait for spawning external processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `program` with `args`
    ///
    /// # Returns
    /// A tuple of (event receiver, process handle)
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>)>;
}

// ============================================================================
// Standard Process Spawner (tokio::process)
// ============================================================================

#[cfg(feature = "std-process")]
mod std_process {
    use super::*;
    use std::path::PathBuf;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
    use tokio::process::{Child, Command};

    use crate::error::InferenceError;

    struct StdProcessHandle {
        child: Arc<Mutex<Option<Child>>>,
        pid: Option<u32>,
    }

    impl ProcessHandle for StdProcessHandle {
        fn pid(&self) -> Option<u32> {
            self.pid
        }

        fn kill(&self) -> Result<()> {
            let mut guard = self.child.lock();
            if let Some(child) = guard.as_mut() {
                match child.start_kill() {
                    Ok(()) => {}
                    // Already reaped
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        }
    }

    /// Process spawner backed by `tokio::process`
    ///
    /// Programs are resolved on `PATH` unless a search directory is set.
    #[derive(Debug, Default, Clone)]
    pub struct StdProcessSpawner {
        search_dir: Option<PathBuf>,
    }

    impl StdProcessSpawner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Resolve programs in `dir` instead of `PATH`
        pub fn with_search_dir(dir: PathBuf) -> Self {
            Self {
                search_dir: Some(dir),
            }
        }

        fn resolve(&self, program: &str) -> Result<PathBuf> {
            match &self.search_dir {
                Some(dir) => {
                    let path = dir.join(program);
                    if path.exists() {
                        Ok(path)
                    } else {
                        Err(not_found(format!("{} not found in {}", program, dir.display())))
                    }
                }
                None => which::which(program)
                    .map_err(|e| not_found(format!("{} not found in PATH: {}", program, e))),
            }
        }
    }

    fn not_found(msg: String) -> InferenceError {
        InferenceError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, msg))
    }

    fn forward_lines<R>(reader: R, tx: mpsc::Sender<ProcessEvent>, wrap: fn(Vec<u8>) -> ProcessEvent)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(wrap(line.into_bytes())).await.is_err() {
                    break;
                }
            }
        });
    }

    #[async_trait]
    impl ProcessSpawner for StdProcessSpawner {
        async fn spawn(
            &self,
            program: &str,
            args: &[String],
        ) -> Result<(mpsc::Receiver<ProcessEvent>, Box<dyn ProcessHandle>)> {
            let binary_path = self.resolve(program)?;

            let mut child = Command::new(&binary_path)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;

            let pid = child.id();
            log::info!("Spawned {} (pid {:?})", binary_path.display(), pid);

            let (tx, rx) = mpsc::channel(100);

            if let Some(stdout) = child.stdout.take() {
                forward_lines(stdout, tx.clone(), ProcessEvent::Stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(stderr, tx.clone(), ProcessEvent::Stderr);
            }

            let child = Arc::new(Mutex::new(Some(child)));

            // Exit monitor
            let monitored = child.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(100)).await;

                    // Check status without holding the lock across await
                    let status = {
                        let mut guard = monitored.lock();
                        match guard.as_mut() {
                            Some(child) => child.try_wait(),
                            None => break,
                        }
                    };

                    match status {
                        Ok(Some(status)) => {
                            let _ = tx.send(ProcessEvent::Terminated(status.code())).await;
                            break;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            let _ = tx.send(ProcessEvent::Error(format!("Wait error: {}", e))).await;
                            break;
                        }
                    }
                }
            });

            Ok((rx, Box::new(StdProcessHandle { child, pid })))
        }
    }
}

#[cfg(feature = "std-process")]
pub use std_process::StdProcessSpawner;
