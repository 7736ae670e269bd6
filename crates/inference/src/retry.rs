//! Retry and degradation policy
//!
//! Used by the browser engine adapter. Retries are bounded and back off
//! exponentially. Resource-limit failures step the context window down, and
//! cancellation always wins over a pending retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::millis;
use crate::constants::retry;
use crate::error::{InferenceError, Result};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Counted retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// The step-down ladder stops here
    pub min_context_window: u32,
    /// Probed storage-buffer limit at or below which the first attempt
    /// already uses `constrained_context_window`
    pub low_storage_buffer_limit: u32,
    pub constrained_context_window: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: retry::MAX_RETRIES,
            base_delay: Duration::from_millis(retry::BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(retry::BACKOFF_MAX_MS),
            min_context_window: retry::MIN_CONTEXT_WINDOW,
            low_storage_buffer_limit: retry::LOW_STORAGE_BUFFER_LIMIT,
            constrained_context_window: retry::CONSTRAINED_CONTEXT_WINDOW,
        }
    }
}

impl RetryPolicy {
    /// Backoff before counted retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(10);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
    }

    /// Next rung on the context-window ladder, halving each time
    /// (4096 -> 2048 -> 1024 -> 512). `None` once the floor is reached.
    pub fn step_down(&self, context_window: u32) -> Option<u32> {
        let next = context_window / 2;
        (next >= self.min_context_window).then_some(next)
    }

    /// Context window for the first attempt given a probed device limit.
    /// Returns the forced override, if any.
    pub fn anticipate(&self, requested: u32, storage_buffer_limit: Option<u32>) -> Option<u32> {
        match storage_buffer_limit {
            Some(limit) if limit <= self.low_storage_buffer_limit => {
                let constrained = requested.min(self.constrained_context_window);
                (constrained < requested).then_some(constrained)
            }
            _ => None,
        }
    }
}

/// State of one `initialize()` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub is_loading: bool,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub model_name: Option<String>,
    /// Degradation override for the context window
    pub forced_context_window: Option<u32>,
}

impl RetryState {
    pub fn begin(model_name: &str) -> Self {
        Self {
            is_loading: true,
            model_name: Some(model_name.to_string()),
            ..Default::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fail with `Canceled` if the token has fired
pub fn ensure_not_canceled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(InferenceError::Canceled)
    } else {
        Ok(())
    }
}

/// Sleep for `delay` unless canceled first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InferenceError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
