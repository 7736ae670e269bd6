//! Multi-backend inference orchestration
//!
//! This library drives three interchangeable inference backends behind one
//! gateway:
//! - **Browser engine**: worker-hosted WebGPU engine with prebuilt models
//! - **Daemon**: a local model-serving daemon reached over HTTP
//! - **Native runtime**: an in-process runtime loading GGUF models
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use inference::{ChatMessage, Collaborators, InferenceConfig, InferenceGateway, Settings};
//! use inference::process::StdProcessSpawner;
//!
//! let gateway = InferenceGateway::from_config(
//!     &InferenceConfig { desktop_host: true, ..Default::default() },
//!     Collaborators {
//!         spawner: Some(Arc::new(StdProcessSpawner::new())),
//!         ..Default::default()
//!     },
//!     Settings::default_path(),
//! );
//!
//! gateway.start().await?;
//! gateway.load_model("llama3.2").await?;
//! let reply = gateway.chat(&[ChatMessage::user("Hello!")]).await?;
//! ```

pub mod backend;
pub mod browser;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod error;
pub mod events;
pub mod gateway;
pub mod native;
pub mod ndjson;
pub mod process;
pub mod retry;
pub mod tools;
pub mod types;

// Re-exports for convenience
pub use backend::{
    BackendCapabilities, BackendInfo, BackendRegistry, ChatStream, InferenceBackend,
};
pub use config::{
    BrowserEngineConfig, DaemonConfig, HistoryReplay, InferenceConfig, NativeRuntimeConfig,
    Settings,
};
pub use error::{ErrorCategory, InferenceError, Result};
pub use events::{EventBus, InferenceEvent};
pub use gateway::{Collaborators, InferenceGateway, SharedGateway};
pub use process::{ProcessEvent, ProcessHandle, ProcessSpawner};
pub use retry::{RetryPolicy, RetryState};
pub use types::{
    BackendKind, ChatMessage, ContentPart, MessageContent, ModelDescriptor, ModelLocation, Role,
    ToolCall, ToolResult,
};

#[cfg(feature = "std-process")]
pub use process::StdProcessSpawner;
