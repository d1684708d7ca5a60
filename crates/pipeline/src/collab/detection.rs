//! HTTP client for the person detection collaborator.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use portray_types::Detection;

use crate::collab::{base64_bytes, status_error, PersonDetector};
use crate::error::{CollabResult, CollaboratorError};

/// Service name used in errors and logs.
pub const SERVICE: &str = "person-detection";

/// Configuration for the detection client.
#[derive(Debug, Clone)]
pub struct DetectionClientConfig {
    /// Base URL of the detection service.
    pub endpoint: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for DetectionClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9101".to_string(),
            timeout_ms: 15_000,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Client for the person detection HTTP service.
pub struct HttpDetectionClient {
    config: DetectionClientConfig,
    client: reqwest::Client,
}

impl HttpDetectionClient {
    /// Create a new detection client.
    pub fn new(config: DetectionClientConfig) -> CollabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &DetectionClientConfig {
        &self.config
    }
}

#[async_trait]
impl PersonDetector for HttpDetectionClient {
    async fn detect(&self, image: &[u8]) -> CollabResult<Vec<Detection>> {
        let url = format!("{}/v1/detect", self.config.endpoint.trim_end_matches('/'));

        debug!(image_bytes = image.len(), "requesting person detection");
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(&DetectRequest { image })
            .send()
            .await
            .map_err(|e| CollaboratorError::from_transport(SERVICE, self.config.timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::inference(SERVICE, format!("invalid response: {e}")))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            detections = parsed.detections.len(),
            elapsed_ms, "person detection complete"
        );

        Ok(parsed.detections)
    }
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    #[serde(with = "base64_bytes")]
    image: &'a [u8],
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<Detection>,
}
