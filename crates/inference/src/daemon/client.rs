//! HTTP client for the model-serving daemon
//!
//! Plain request/response calls for list/show/delete, and newline-delimited
//! JSON streaming for pull and chat. Nothing here retries; that is the
//! caller's concern.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::DaemonConfig;
use crate::constants::daemon_api;
use crate::error::{InferenceError, Result};
use crate::events::{EventBus, InferenceEvent};
use crate::ndjson::decode_ndjson;
use crate::types::{
    require_user_last, BackendKind, ChatMessage, ModelDescriptor, ModelLocation, PullProgress,
    Role,
};

/// Client for the daemon's REST API
#[derive(Debug, Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    events: EventBus,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
    digest: Option<String>,
    modified_at: Option<String>,
}

/// One line of a pull response
#[derive(Debug, Default, Deserialize)]
struct PullRecord {
    #[serde(default)]
    status: String,
    completed: Option<u64>,
    total: Option<u64>,
    error: Option<String>,
}

/// One line of a chat response (or the whole non-streaming body)
#[derive(Debug, Default, Deserialize)]
struct ChatRecord {
    message: Option<ChatRecordMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatRecordMessage {
    #[serde(default)]
    content: String,
}

/// Message in the daemon's wire format
#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        // The daemon takes raw base64, not data URLs
        let images = message
            .content
            .image_urls()
            .into_iter()
            .map(|url| match url.split_once(";base64,") {
                Some((_, data)) => data.to_string(),
                None => url.to_string(),
            })
            .collect();

        Self {
            role,
            content: message.text(),
            images,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig, events: EventBus) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: config.probe_timeout,
            events,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into a descriptive error
    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{} failed with HTTP {}: {}", what, status.as_u16(), body.trim());
        if status.is_client_error() {
            Err(InferenceError::precondition(message))
        } else {
            Err(InferenceError::Network(message))
        }
    }

    /// Short-timeout liveness probe. Any failure counts as not running.
    pub async fn is_running(&self) -> bool {
        match self
            .http
            .get(self.url(daemon_api::TAGS))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("Daemon probe failed: {}", e);
                false
            }
        }
    }

    /// Installed models
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        let response = self.http.get(self.url(daemon_api::TAGS)).send().await?;
        let tags: TagsResponse = Self::check(response, "list models").await?.json().await?;

        Ok(tags
            .models
            .into_iter()
            .map(|entry| ModelDescriptor {
                display_name: entry.name.clone(),
                name: entry.name.clone(),
                size_bytes: entry.size,
                location: ModelLocation::Tag {
                    tag: entry.name,
                    digest: entry.digest,
                    modified_at: entry.modified_at,
                },
            })
            .collect())
    }

    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(daemon_api::DELETE))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Self::check(response, "delete model").await?;
        log::info!("Deleted daemon model {}", name);
        Ok(())
    }

    /// Raw model metadata (modelfile, parameters, template, details)
    pub async fn show_model_info(&self, name: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(daemon_api::SHOW))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        Ok(Self::check(response, "show model").await?.json().await?)
    }

    /// Pull a model, emitting `PullProgress` events while it downloads.
    ///
    /// Returns on the first `success` status. A body that ends without one
    /// is logged and treated as finished.
    pub async fn pull_model(&self, name: &str) -> Result<()> {
        log::info!("Pulling daemon model {}", name);
        let response = self
            .http
            .post(self.url(daemon_api::PULL))
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .send()
            .await?;
        let response = Self::check(response, "pull model").await?;

        let records = decode_ndjson::<PullRecord, _, _, _>(response.bytes_stream());
        let mut records = Box::pin(records);

        while let Some(record) = records.next().await {
            let record = record?;
            if let Some(error) = record.error {
                return Err(InferenceError::classify(error));
            }

            let completed = record.completed.unwrap_or(0);
            let reported_total = record.total.unwrap_or(0);
            let total = if reported_total > 0 { reported_total } else { completed };
            let success = record.status == "success";

            if reported_total > 0 || success || record.status.contains("pulling") {
                self.events.emit(InferenceEvent::PullProgress(PullProgress {
                    model: name.to_string(),
                    status: record.status.clone(),
                    completed,
                    total,
                }));
            }

            if success {
                log::info!("Pulled daemon model {}", name);
                return Ok(());
            }
        }

        log::warn!("Pull stream for {} ended without a success status", name);
        Ok(())
    }

    /// Chat with a model and return the full response.
    ///
    /// When streaming, each delta is emitted as a `ChatToken` event.
    pub async fn chat(&self, model: &str, messages: &[ChatMessage], stream: bool) -> Result<String> {
        require_user_last(messages)?;

        if !stream {
            let response = self.send_chat(model, messages, false).await?;
            let record: ChatRecord = response.json().await?;
            if let Some(error) = record.error {
                return Err(InferenceError::classify(error));
            }
            return Ok(record.message.map(|m| m.content).unwrap_or_default());
        }

        let mut deltas = Box::pin(self.chat_stream(model, messages).await?);
        let mut full = String::new();
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            self.events.emit(InferenceEvent::ChatToken {
                backend: BackendKind::Daemon,
                text: delta.clone(),
            });
            full.push_str(&delta);
        }
        Ok(full)
    }

    /// Streaming chat as a sequence of content deltas. The sequence ends at
    /// the `done` record, or at end of body when none arrives.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<impl Stream<Item = Result<String>> + Send + 'static> {
        require_user_last(messages)?;
        let response = self.send_chat(model, messages, true).await?;
        let records = decode_ndjson::<ChatRecord, _, _, _>(response.bytes_stream());

        Ok(async_stream::try_stream! {
            let mut records = Box::pin(records);
            while let Some(record) = records.next().await {
                let record = record?;
                if let Some(error) = record.error {
                    Err::<(), _>(InferenceError::classify(error))?;
                }
                if let Some(message) = record.message {
                    if !message.content.is_empty() {
                        yield message.content;
                    }
                }
                if record.done {
                    break;
                }
            }
        })
    }

    async fn send_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model,
            messages: messages.iter().map(WireMessage::from).collect(),
            stream,
        };
        let response = self
            .http
            .post(self.url(daemon_api::CHAT))
            .json(&request)
            .send()
            .await?;
        Self::check(response, "chat").await
    }
}
