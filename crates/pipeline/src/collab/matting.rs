//! HTTP client for the background matting collaborator.
//!
//! Matting uploads are multipart rather than JSON: portrait images are the
//! largest payload the pipeline moves and base64 inflation is worth avoiding
//! on this hop. The subject region rides along as a JSON form field.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use portray_types::BoundingBox;

use crate::collab::{base64_bytes, status_error, BackgroundMatter, MattingOutput};
use crate::error::{CollabResult, CollaboratorError};

/// Service name used in errors and logs.
pub const SERVICE: &str = "background-matting";

/// Configuration for the matting client.
#[derive(Debug, Clone)]
pub struct MattingClientConfig {
    /// Base URL of the matting service.
    pub endpoint: String,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for MattingClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9102".to_string(),
            timeout_ms: 30_000,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Client for the background matting HTTP service.
pub struct HttpMattingClient {
    config: MattingClientConfig,
    client: reqwest::Client,
}

impl HttpMattingClient {
    /// Create a new matting client.
    pub fn new(config: MattingClientConfig) -> CollabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &MattingClientConfig {
        &self.config
    }
}

#[async_trait]
impl BackgroundMatter for HttpMattingClient {
    async fn remove_background(
        &self,
        image: &[u8],
        subject: &BoundingBox,
    ) -> CollabResult<MattingOutput> {
        let url = format!("{}/v1/matte", self.config.endpoint.trim_end_matches('/'));

        let subject_json = serde_json::to_string(subject)
            .map_err(|e| CollaboratorError::inference(SERVICE, format!("encode subject: {e}")))?;

        debug!(
            image_bytes = image.len(),
            subject = %subject_json,
            "requesting background removal"
        );
        let start = Instant::now();

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(image.to_vec()).file_name("portrait"),
            )
            .text("subject", subject_json);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CollaboratorError::from_transport(SERVICE, self.config.timeout_ms, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let parsed: MatteResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::inference(SERVICE, format!("invalid response: {e}")))?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            matte_bytes = parsed.image.len(),
            mask_coverage = parsed.mask_coverage,
            elapsed_ms,
            "background removal complete"
        );

        Ok(MattingOutput {
            image: parsed.image,
            mask_coverage: parsed.mask_coverage,
        })
    }
}

#[derive(Deserialize)]
struct MatteResponse {
    #[serde(with = "base64_bytes")]
    image: Vec<u8>,
    mask_coverage: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MattingClientConfig::default();
        assert_eq!(config.endpoint, "http://127.0.0.1:9102");
        assert_eq!(config.timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_matte_response() {
        let json = r#"{"image": "bWF0dGVk", "mask_coverage": 0.42}"#;
        let parsed: MatteResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.image, b"matted");
        assert!((parsed.mask_coverage - 0.42).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_rejects_bad_base64() {
        let json = r#"{"image": "%%%not-base64%%%", "mask_coverage": 0.5}"#;
        assert!(serde_json::from_str::<MatteResponse>(json).is_err());
    }
}
