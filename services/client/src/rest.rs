//! REST Collaborators
//!
//! The backend's plain HTTP endpoints: the health check and the remote
//! snapshot store behind `/v1/memories`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parley_core::sync::RemoteMemories;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Liveness and capability flags reported by `/v1/health`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStatus {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub stt_up: bool,
    #[serde(default)]
    pub tts_up: bool,
    #[serde(default)]
    pub llm_up: bool,
    #[serde(default)]
    pub voice_cloning_up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Reachable(HealthStatus),
    /// No usable answer within the timeout.
    Unreachable,
}

#[derive(Serialize)]
struct UploadBody<'a> {
    filename: &'a str,
    content: &'a str,
}

/// HTTP client for one backend.
#[derive(Clone, Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    health_timeout: Duration,
}

impl BackendClient {
    /// `request_timeout` bounds every request; health checks are further
    /// bounded by `health_timeout`.
    pub fn new(
        base_url: &str,
        health_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid backend URL '{base_url}'"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("Backend URL '{base_url}' cannot have a path"));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            health_timeout,
        })
    }

    /// `<base>/<segments...>`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Calls `/v1/health`, treating any failure or timeout as unreachable.
    pub async fn health(&self) -> Health {
        let url = self.endpoint(&["v1", "health"]);
        let check = async {
            self.http
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .json::<HealthStatus>()
                .await
        };
        match tokio::time::timeout(self.health_timeout, check).await {
            Ok(Ok(status)) => {
                debug!(?status, "Backend health");
                Health::Reachable(status)
            }
            Ok(Err(e)) => {
                warn!(%url, error = %e, "Health check failed");
                Health::Unreachable
            }
            Err(_) => {
                warn!(%url, timeout = ?self.health_timeout, "Health check timed out");
                Health::Unreachable
            }
        }
    }
}

#[async_trait]
impl RemoteMemories for BackendClient {
    async fn list(&self, voice_name: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&["v1", "memories", voice_name]);
        let filenames = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<String>>()
            .await
            .context("Memory listing was not a list of filenames")?;
        Ok(filenames)
    }

    async fn fetch(&self, voice_name: &str, filename: &str) -> Result<String> {
        let url = self.endpoint(&["v1", "memories", voice_name, filename]);
        let content = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(content)
    }

    async fn upload(&self, voice_name: &str, filename: &str, content: String) -> Result<()> {
        let url = self.endpoint(&["v1", "memories", voice_name]);
        self.http
            .post(url)
            .json(&UploadBody {
                filename,
                content: &content,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
