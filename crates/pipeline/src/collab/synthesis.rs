//! HTTP client for the lip-sync synthesis collaborator.
//!
//! Synthesis is the long pole of a run, so the service executes jobs
//! asynchronously: create the job, poll until it settles, then fetch the
//! rendered video. The configured deadline spans all three phases; if it
//! expires mid-render the client sends a best-effort cancel so the remote
//! render slot is not left burning.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collab::{base64_bytes, status_error, SpeechSynthesizer, SynthesisOutput};
use crate::error::{CollabResult, CollaboratorError};

/// Service name used in errors and logs.
pub const SERVICE: &str = "speech-synthesis";

/// Configuration for the synthesis client.
#[derive(Debug, Clone)]
pub struct SynthesisClientConfig {
    /// Base URL of the synthesis service.
    pub endpoint: String,
    /// Overall deadline for create + render + fetch, in milliseconds.
    pub timeout_ms: u64,
    /// Timeout for each individual HTTP request in milliseconds.
    pub request_timeout_ms: u64,
    /// Status poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for SynthesisClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9103".to_string(),
            timeout_ms: 180_000, // renders routinely run minutes
            request_timeout_ms: 30_000,
            poll_interval_ms: 500,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Client for the asynchronous synthesis HTTP service.
pub struct HttpSynthesisClient {
    config: SynthesisClientConfig,
    client: reqwest::Client,
}

impl HttpSynthesisClient {
    /// Create a new synthesis client.
    pub fn new(config: SynthesisClientConfig) -> CollabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &SynthesisClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn create_job(&self, portrait: &[u8], audio: &[u8]) -> CollabResult<String> {
        let response = self
            .client
            .post(self.url("/v1/jobs"))
            .json(&CreateJobRequest { portrait, audio })
            .send()
            .await
            .map_err(|e| {
                CollaboratorError::from_transport(SERVICE, self.config.request_timeout_ms, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let created: CreateJobResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::inference(SERVICE, format!("invalid response: {e}")))?;
        Ok(created.job_id)
    }

    async fn poll_job(&self, job_id: &str) -> CollabResult<JobStatusResponse> {
        let response = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}")))
            .send()
            .await
            .map_err(|e| {
                CollaboratorError::from_transport(SERVICE, self.config.request_timeout_ms, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::inference(SERVICE, format!("invalid response: {e}")))
    }

    async fn fetch_result(&self, job_id: &str) -> CollabResult<Vec<u8>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/jobs/{job_id}/result")))
            .send()
            .await
            .map_err(|e| {
                CollaboratorError::from_transport(SERVICE, self.config.request_timeout_ms, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let bytes = response.bytes().await.map_err(|e| {
            CollaboratorError::from_transport(SERVICE, self.config.request_timeout_ms, e)
        })?;
        Ok(bytes.to_vec())
    }

    /// Fire-and-forget job cancellation after a client-side deadline expiry.
    async fn try_cancel(&self, job_id: &str) {
        let result = self
            .client
            .post(self.url(&format!("/v1/jobs/{job_id}/cancel")))
            .send()
            .await;
        if let Err(e) = result {
            debug!(job_id, error = %e, "cancel request failed");
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesisClient {
    async fn synthesize(&self, portrait: &[u8], audio: &[u8]) -> CollabResult<SynthesisOutput> {
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let start = Instant::now();

        let job_id = self.create_job(portrait, audio).await?;
        debug!(
            job_id = %job_id,
            portrait_bytes = portrait.len(),
            audio_bytes = audio.len(),
            "synthesis job created"
        );

        loop {
            if start.elapsed() >= deadline {
                warn!(job_id = %job_id, "synthesis deadline expired, cancelling job");
                self.try_cancel(&job_id).await;
                return Err(CollaboratorError::timeout(SERVICE, self.config.timeout_ms));
            }
            tokio::time::sleep(poll_interval).await;

            let status = self.poll_job(&job_id).await?;
            match job_state(&status) {
                JobState::Waiting => {
                    debug!(job_id = %job_id, progress = status.progress, "render in progress");
                }
                JobState::Completed => break,
                JobState::Failed(reason) => {
                    return Err(CollaboratorError::inference(SERVICE, reason));
                }
            }
        }

        let video = self.fetch_result(&job_id).await?;
        let render_time_ms = start.elapsed().as_millis() as u64;

        info!(
            job_id = %job_id,
            video_bytes = video.len(),
            render_time_ms,
            "synthesis complete"
        );

        Ok(SynthesisOutput {
            video,
            render_time_ms,
        })
    }
}

#[derive(Serialize)]
struct CreateJobRequest<'a> {
    #[serde(with = "base64_bytes")]
    portrait: &'a [u8],
    #[serde(with = "base64_bytes")]
    audio: &'a [u8],
}

#[derive(Deserialize)]
struct CreateJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: String,
    #[serde(default)]
    progress: f32,
    #[serde(default)]
    error: String,
}

#[derive(Debug, PartialEq)]
enum JobState {
    Waiting,
    Completed,
    Failed(String),
}

fn job_state(status: &JobStatusResponse) -> JobState {
    match status.status.as_str() {
        "queued" | "pending" | "running" => JobState::Waiting,
        "completed" => JobState::Completed,
        "failed" => {
            let reason = if status.error.is_empty() {
                "unknown error".to_string()
            } else {
                status.error.clone()
            };
            JobState::Failed(reason)
        }
        other => JobState::Failed(format!("unknown status: {other}")),
    }
}
