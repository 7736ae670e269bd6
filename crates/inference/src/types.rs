//! Common types for inference operations

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};

/// The three interchangeable inference providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Worker-hosted WebGPU engine
    BrowserEngine,
    /// Model-serving daemon reached over local HTTP
    Daemon,
    /// In-process native runtime
    NativeRuntime,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::BrowserEngine,
        BackendKind::Daemon,
        BackendKind::NativeRuntime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::BrowserEngine => "browser_engine",
            BackendKind::Daemon => "daemon",
            BackendKind::NativeRuntime => "native_runtime",
        }
    }

    /// Default selection for the host environment: the daemon in a desktop
    /// host, the browser engine otherwise.
    pub fn default_for_host(desktop_host: bool) -> Self {
        if desktop_host {
            BackendKind::Daemon
        } else {
            BackendKind::BrowserEngine
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "browser_engine" | "browser" | "webllm" => Ok(BackendKind::BrowserEngine),
            "daemon" | "ollama" => Ok(BackendKind::Daemon),
            "native_runtime" | "native" | "llamacpp" | "llama.cpp" => {
                Ok(BackendKind::NativeRuntime)
            }
            other => Err(format!("Unknown backend: {}", other)),
        }
    }
}

/// A model as listed by a backend. A fresh list replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Identifier passed back to `load_model`
    pub name: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub location: ModelLocation,
}

/// Backend-specific handle for locating a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelLocation {
    /// Prebuilt browser-engine model id
    Prebuilt { model_id: String },
    /// Daemon tag with registry metadata
    Tag {
        tag: String,
        digest: Option<String>,
        modified_at: Option<String>,
    },
    /// GGUF file on disk
    File { path: PathBuf },
}

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Chat message with multimodal content support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    /// Tool calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Correlation id of a tool result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant turn that requested tool calls
    pub fn assistant_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::assistant(text)
        }
    }

    /// Result of a tool call fed back to the model
    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            ..Self::new(Role::Tool, result.content.clone())
        }
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Every backend requires the submitted history to end with a user turn.
pub fn require_user_last(messages: &[ChatMessage]) -> Result<&ChatMessage> {
    match messages.last() {
        Some(last) if last.role == Role::User => Ok(last),
        Some(last) => Err(InferenceError::precondition(format!(
            "last message must be from the user, got {:?}",
            last.role
        ))),
        None => Err(InferenceError::precondition("no messages to send")),
    }
}

/// Plain text or structured multi-part content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Image URLs (usually base64 data URLs) attached to the message
    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/// Content part - text or image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlData },
}

/// Image URL data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrlData {
    pub url: String,
}

/// Progress of a daemon model pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    pub model: String,
    pub status: String,
    pub completed: u64,
    pub total: u64,
}

impl PullProgress {
    pub fn percent(&self) -> f64 {
        percent_of(self.completed, self.total)
    }
}

/// Progress of a native model file download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub filename: String,
    pub downloaded: u64,
    pub total: u64,
    pub percent: u8,
}

/// Progress of browser-engine initialization (download + compile)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitProgress {
    /// Percentage in 0..=100
    pub percent: u8,
    pub text: String,
    /// Loading finished; the visible indicator should reset
    pub finished: bool,
}

/// Percentage that tolerates a zero total
pub fn percent_of(completed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (completed as f64 / total as f64 * 100.0).min(100.0)
    }
}

/// A complete, model-initiated function call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON argument string as produced by the model
    pub arguments: String,
}

/// Result of executing a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// JSON payload; execution failures are encoded here as `{"error": ...}`
    pub content: String,
}
