//! Error taxonomy for inference operations
//!
//! Every failure surfaced by the managers and the gateway is an
//! [`InferenceError`]. Each variant maps onto an [`ErrorCategory`] which the
//! UI uses to pick an actionable message and to decide whether to show an
//! error at all (user-initiated cancellation is never shown as a failure).

use serde::Serialize;

use crate::constants::retry::STORAGE_BUFFER_LIMIT_MARKER;

/// Result type alias using InferenceError
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Error types for inference operations
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Required GPU capability is missing
    #[error("GPU acceleration unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Network failure: {0}")]
    Network(String),

    /// Model cache could not be read or written
    #[error("Model cache error: {0}")]
    Cache(String),

    /// Device or GPU limit exceeded and no further downgrade is possible
    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// A stale native handle was used after disposal
    #[error("Native handle was disposed: {0}")]
    HandleDisposed(String),

    #[error("Daemon did not become healthy after {attempts} probes")]
    StartupTimeout { attempts: u32 },

    /// Programming or caller error; never retried
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Model is already loading")]
    AlreadyLoading,

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Operation canceled")]
    Canceled,

    /// Counted retries exhausted; wraps the last failure
    #[error("Failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<InferenceError>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Coarse category used for retry decisions and user-facing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NoGpu,
    Network,
    Cache,
    ResourceLimit,
    HandleDisposed,
    StartupTimeout,
    Precondition,
    ToolExecution,
    Canceled,
    Unknown,
}

impl InferenceError {
    /// Create a precondition error with a message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    /// Classify a raw error message reported by an engine or binding.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains(STORAGE_BUFFER_LIMIT_MARKER)
            || lower.contains("maxstoragebuffers")
            || lower.contains("out of memory")
            || lower.contains("device lost")
        {
            Self::ResourceLimitExceeded(message)
        } else if lower.contains("disposed") {
            Self::HandleDisposed(message)
        } else if lower.contains("webgpu")
            || lower.contains("no gpu")
            || lower.contains("gpu acceleration")
            || lower.contains("adapter")
        {
            Self::CapabilityUnavailable(message)
        } else if lower.contains("cache")
            || lower.contains("indexeddb")
            || lower.contains("quota")
        {
            Self::Cache(message)
        } else if lower.contains("network")
            || lower.contains("fetch")
            || lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("timeout")
        {
            Self::Network(message)
        } else {
            Self::Unknown(message)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CapabilityUnavailable(_) => ErrorCategory::NoGpu,
            Self::Network(_) | Self::Http(_) => ErrorCategory::Network,
            Self::Cache(_) | Self::Io(_) => ErrorCategory::Cache,
            Self::ResourceLimitExceeded(_) => ErrorCategory::ResourceLimit,
            Self::HandleDisposed(_) => ErrorCategory::HandleDisposed,
            Self::StartupTimeout { .. } => ErrorCategory::StartupTimeout,
            Self::PreconditionViolation(_) | Self::AlreadyLoading => ErrorCategory::Precondition,
            Self::ToolExecution(_) => ErrorCategory::ToolExecution,
            Self::Canceled => ErrorCategory::Canceled,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::Serialization(_) | Self::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.category() == ErrorCategory::Canceled
    }

    /// Whether a counted retry with backoff may fix this failure.
    ///
    /// Resource-limit failures are handled by the downgrade path, not here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Cache | ErrorCategory::Unknown
        )
    }

    /// Actionable message for the UI. The raw error text is appended as
    /// detail, never shown on its own.
    pub fn user_message(&self) -> String {
        let headline = match self.category() {
            ErrorCategory::NoGpu => {
                "This device does not support GPU acceleration. Switch to the local daemon or native runtime backend."
            }
            ErrorCategory::Network => {
                "Could not reach the model source. Check your internet connection and try again."
            }
            ErrorCategory::Cache => {
                "The model cache could not be used. Clear the app cache and try loading the model again."
            }
            ErrorCategory::ResourceLimit => {
                "Your GPU ran out of resources for this model. Try a smaller model, a smaller context window, or switch backend."
            }
            ErrorCategory::HandleDisposed => {
                "The model was unloaded while in use. Please reload the model."
            }
            ErrorCategory::StartupTimeout => {
                "The local model daemon did not start in time. Make sure it is installed and try again."
            }
            ErrorCategory::Precondition => {
                "The request could not be started. Load a model and make sure the last message is yours."
            }
            ErrorCategory::ToolExecution => "A tool failed while answering. The model was told about the failure.",
            ErrorCategory::Canceled => "Stopped.",
            ErrorCategory::Unknown => {
                "Something went wrong while running the model. Try a different model or backend."
            }
        };

        if self.is_canceled() {
            headline.to_string()
        } else {
            format!("{} ({})", headline, self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_storage_buffer_limit() {
        let err = InferenceError::classify("Error: exceeded storage buffer limit (10 > 8)");
        assert_eq!(err.category(), ErrorCategory::ResourceLimit);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_network_and_cache() {
        assert_eq!(
            InferenceError::classify("Failed to fetch").category(),
            ErrorCategory::Network
        );
        assert_eq!(
            InferenceError::classify("QuotaExceededError while writing").category(),
            ErrorCategory::Cache
        );
        assert_eq!(
            InferenceError::classify("object is disposed").category(),
            ErrorCategory::HandleDisposed
        );
        assert_eq!(
            InferenceError::classify("weird").category(),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_exhausted_keeps_source_category() {
        let err = InferenceError::RetriesExhausted {
            attempts: 4,
            source: Box::new(InferenceError::Network("offline".into())),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.user_message().contains("internet connection"));
    }

    #[test]
    fn test_precondition_never_retried() {
        assert!(!InferenceError::precondition("no model").is_retryable());
        assert!(!InferenceError::AlreadyLoading.is_retryable());
        assert!(!InferenceError::CapabilityUnavailable("none".into()).is_retryable());
        assert!(!InferenceError::Canceled.is_retryable());
    }

    #[test]
    fn test_canceled_message_has_no_detail() {
        assert_eq!(InferenceError::Canceled.user_message(), "Stopped.");
    }
}
