//! Model file downloads into the native models directory
//!
//! Redirects are followed by hand so the hop count is bounded and every hop
//! is logged. Failures are reported in the returned [`DownloadOutcome`];
//! nothing here returns `Err`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::constants::native::MAX_REDIRECTS;
use crate::events::{EventBus, InferenceEvent};
use crate::types::DownloadProgress;

/// Result of a download attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn ok(path: PathBuf) -> Self {
        Self {
            success: true,
            path: Some(path),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            path: None,
            error: Some(error.into()),
        }
    }
}

/// Downloads model files, emitting `DownloadProgress` events
pub struct ModelDownloader {
    http: reqwest::Client,
    models_dir: PathBuf,
    events: EventBus,
}

impl ModelDownloader {
    pub fn new(models_dir: PathBuf, events: EventBus) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            http,
            models_dir,
            events,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Download `url` to `<models_dir>/<filename>`
    pub async fn download(&self, url: &str, filename: &str) -> DownloadOutcome {
        log::info!("Download requested: {} -> {}", url, filename);

        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename == "."
            || filename == ".."
        {
            return DownloadOutcome::failed(format!("Invalid file name: {}", filename));
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.models_dir).await {
            return DownloadOutcome::failed(e.to_string());
        }

        let response = match self.follow_redirects(url).await {
            Ok(response) => response,
            Err(error) => {
                log::error!("Download of {} failed: {}", url, error);
                return DownloadOutcome::failed(error);
            }
        };

        let dest = self.models_dir.join(filename);
        match self.write_body(response, &dest, filename).await {
            Ok(()) => {
                log::info!("Download complete: {}", dest.display());
                DownloadOutcome::ok(dest)
            }
            Err(error) => {
                log::error!("Download of {} failed: {}", url, error);
                let _ = tokio::fs::remove_file(&dest).await;
                DownloadOutcome::failed(error)
            }
        }
    }

    async fn follow_redirects(&self, url: &str) -> Result<reqwest::Response, String> {
        let mut current = reqwest::Url::parse(url).map_err(|e| e.to_string())?;

        for _ in 0..=MAX_REDIRECTS {
            let response = self
                .http
                .get(current.clone())
                .send()
                .await
                .map_err(|e| e.to_string())?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    current = current.join(location).map_err(|e| e.to_string())?;
                    log::debug!("Redirecting to {}", current);
                    continue;
                }
            }

            if status != reqwest::StatusCode::OK {
                return Err(format!("HTTP {}", status.as_u16()));
            }
            return Ok(response);
        }

        Err("Too many redirects".to_string())
    }

    async fn write_body(
        &self,
        mut response: reqwest::Response,
        dest: &Path,
        filename: &str,
    ) -> Result<(), String> {
        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| e.to_string())?;
        let mut downloaded = 0u64;

        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            downloaded += chunk.len() as u64;

            if total > 0 {
                let percent = ((downloaded as f64 / total as f64) * 100.0).round().min(100.0) as u8;
                self.events.emit(InferenceEvent::DownloadProgress(DownloadProgress {
                    filename: filename.to_string(),
                    downloaded,
                    total,
                    percent,
                }));
            }
        }

        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}
