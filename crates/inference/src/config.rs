//! Configuration types for the inference library

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{browser, hosts, native, ports, settings, timeouts};
use crate::error::Result;
use crate::native::RuntimeOptions;
use crate::retry::RetryPolicy;
use crate::types::BackendKind;

/// Top-level configuration handed to the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub daemon: DaemonConfig,
    pub native: NativeRuntimeConfig,
    pub browser: BrowserEngineConfig,
    pub retry: RetryPolicy,
    /// Running inside the desktop host (decides the default backend)
    pub desktop_host: bool,
}

/// Model-serving daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub base_url: String,
    /// Daemon binary, looked up on PATH
    pub binary: String,
    pub args: Vec<String>,
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
    #[serde(with = "millis")]
    pub startup_poll_interval: Duration,
    pub startup_max_attempts: u32,
    #[serde(with = "millis")]
    pub health_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://{}:{}", hosts::LOCAL, ports::DAEMON),
            binary: "ollama".to_string(),
            args: vec!["serve".to_string()],
            probe_timeout: Duration::from_millis(timeouts::PROBE_MS),
            startup_poll_interval: Duration::from_millis(timeouts::STARTUP_POLL_MS),
            startup_max_attempts: timeouts::STARTUP_MAX_ATTEMPTS,
            health_interval: Duration::from_secs(timeouts::HEALTH_INTERVAL_SECS),
        }
    }
}

/// Native runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeRuntimeConfig {
    /// Directory scanned for GGUF models and used as download target
    pub models_dir: PathBuf,
    /// Explicit overrides; unset fields fall back to env, then defaults
    pub options: RuntimeOptions,
    pub history_replay: HistoryReplay,
}

impl Default for NativeRuntimeConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            models_dir: home.join(native::MODELS_DIR),
            options: RuntimeOptions::default(),
            history_replay: HistoryReplay::default(),
        }
    }
}

/// How prior turns are replayed into a fresh native chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReplay {
    /// Replay system, user and assistant turns
    #[default]
    Full,
    /// Replay system and user turns only
    ExcludeAssistant,
}

/// In-browser engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserEngineConfig {
    pub context_window_size: u32,
    /// Context window requested for vision models
    pub vision_context_window_size: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tool_rounds: usize,
    pub system_prompt: String,
    /// Extra instructions appended to the system prompt when enabled
    pub custom_instructions: Option<String>,
    pub custom_instructions_enabled: bool,
}

impl Default for BrowserEngineConfig {
    fn default() -> Self {
        Self {
            context_window_size: browser::CONTEXT_WINDOW_SIZE,
            vision_context_window_size: browser::VISION_CONTEXT_WINDOW_SIZE,
            max_tokens: browser::MAX_TOKENS,
            temperature: browser::TEMPERATURE,
            top_p: browser::TOP_P,
            max_tool_rounds: browser::MAX_TOOL_ROUNDS,
            system_prompt: browser::SYSTEM_PROMPT.to_string(),
            custom_instructions: None,
            custom_instructions_enabled: false,
        }
    }
}

impl BrowserEngineConfig {
    /// System prompt including custom instructions when enabled
    pub fn effective_system_prompt(&self) -> String {
        match &self.custom_instructions {
            Some(extra) if self.custom_instructions_enabled && !extra.trim().is_empty() => format!(
                "{} You are also provided with the following information from the user, keep them in mind for your responses: {}",
                self.system_prompt, extra
            ),
            _ => self.system_prompt.clone(),
        }
    }

    /// Context window requested for a model before any degradation
    pub fn context_window_for(&self, model: &str) -> u32 {
        if model.to_lowercase().contains("vision") {
            self.vision_context_window_size
        } else {
            self.context_window_size
        }
    }
}

/// Settings persisted across sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub selected_backend: Option<BackendKind>,
    /// Last selected model per backend
    pub selected_models: HashMap<BackendKind, String>,
}

impl Settings {
    /// Default settings file under the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(settings::APP_DIR).join(settings::FILE_NAME))
    }

    /// Load settings; a missing or corrupt file yields defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

/// Serialize durations as integer milliseconds
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
