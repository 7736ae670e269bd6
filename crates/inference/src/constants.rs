//! Shared constants for the inference library

/// Network hosts
pub mod hosts {
    pub const LOCAL: &str = "127.0.0.1";
}

/// Network ports
pub mod ports {
    /// Default port of the model-serving daemon
    pub const DAEMON: u16 = 11434;
}

/// Daemon HTTP API paths
pub mod daemon_api {
    pub const TAGS: &str = "/api/tags";
    pub const PULL: &str = "/api/pull";
    pub const DELETE: &str = "/api/delete";
    pub const CHAT: &str = "/api/chat";
    pub const SHOW: &str = "/api/show";
}

/// Timeouts and polling intervals
pub mod timeouts {
    /// Liveness probe timeout
    pub const PROBE_MS: u64 = 2_000;
    /// Interval between startup liveness probes
    pub const STARTUP_POLL_MS: u64 = 500;
    /// Number of startup probes before giving up
    pub const STARTUP_MAX_ATTEMPTS: u32 = 30;
    /// Interval of the background health probe
    pub const HEALTH_INTERVAL_SECS: u64 = 10;
}

/// Retry and degradation policy
pub mod retry {
    /// Counted retries after the first attempt
    pub const MAX_RETRIES: u32 = 3;
    pub const BACKOFF_BASE_MS: u64 = 1_000;
    pub const BACKOFF_MAX_MS: u64 = 30_000;
    /// Smallest context window the step-down ladder will reach
    pub const MIN_CONTEXT_WINDOW: u32 = 512;
    /// Storage-buffer bindings per shader stage at or below which the
    /// context window is reduced before the first attempt
    pub const LOW_STORAGE_BUFFER_LIMIT: u32 = 8;
    /// Context window used on devices with a low storage-buffer limit
    pub const CONSTRAINED_CONTEXT_WINDOW: u32 = 2048;
    /// Error fragment reported by the engine when the device limit is hit
    pub const STORAGE_BUFFER_LIMIT_MARKER: &str = "exceeded storage buffer limit";
}

/// Defaults for the in-browser engine
pub mod browser {
    pub const CONTEXT_WINDOW_SIZE: u32 = 4096;
    pub const VISION_CONTEXT_WINDOW_SIZE: u32 = 8192;
    pub const MAX_TOKENS: u32 = 2048;
    pub const TEMPERATURE: f32 = 0.6;
    pub const TOP_P: f32 = 0.9;
    pub const MAX_TOOL_ROUNDS: usize = 5;
    pub const SYSTEM_PROMPT: &str =
        "You are a helpful assistant. Assist the user with their questions.";
}

/// Defaults for the native runtime
pub mod native {
    /// Directory under the home directory holding GGUF models
    pub const MODELS_DIR: &str = ".offeline/models";
    pub const MODEL_EXTENSION: &str = "gguf";
    pub const MAX_REDIRECTS: u32 = 5;
}

/// Environment variables read by the native runtime option resolver
pub mod env {
    pub const GPU: &str = "LLAMA_GPU";
    pub const BUILD: &str = "LLAMA_BUILD";
    pub const DEBUG: &str = "LLAMA_DEBUG";
    pub const MAX_THREADS: &str = "LLAMA_MAX_THREADS";
}

/// Persisted settings
pub mod settings {
    pub const APP_DIR: &str = "omnibot";
    pub const FILE_NAME: &str = "settings.json";
}
