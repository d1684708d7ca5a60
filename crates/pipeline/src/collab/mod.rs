//! Collaborator service contracts.
//!
//! The model-serving bodies of the pipeline (person detection, background
//! matting, speech-driven video synthesis) run out of process and are
//! reached over HTTP. The traits here are what the controller orchestrates
//! against; the `Http*Client` types are the production implementations and
//! mocks stand in for them in tests.
//!
//! Every call resolves to `ServiceUnavailable`, `InferenceError`, or
//! `Timeout` on failure. Clients never retry: retry policy belongs to the
//! caller, which knows whether a GPU grant is being held across the call.

use async_trait::async_trait;

use portray_types::{BoundingBox, Detection};

use crate::error::{CollabResult, CollaboratorError};

pub mod detection;
pub mod matting;
pub mod synthesis;

pub use detection::{DetectionClientConfig, HttpDetectionClient};
pub use matting::{HttpMattingClient, MattingClientConfig};
pub use synthesis::{HttpSynthesisClient, SynthesisClientConfig};

/// Person detection collaborator.
#[async_trait]
pub trait PersonDetector: Send + Sync {
    /// Detect persons in an encoded portrait image.
    ///
    /// Returns every detection the model reports, unfiltered; confidence
    /// thresholds are applied by subject selection.
    async fn detect(&self, image: &[u8]) -> CollabResult<Vec<Detection>>;
}

/// Background matting collaborator.
#[async_trait]
pub trait BackgroundMatter: Send + Sync {
    /// Remove the background around the subject region.
    ///
    /// Returns the matted image, encoded, with the area outside the subject
    /// made transparent.
    async fn remove_background(
        &self,
        image: &[u8],
        subject: &BoundingBox,
    ) -> CollabResult<MattingOutput>;
}

/// Lip-sync video synthesis collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render a lip-synced video of the matted portrait speaking the audio.
    async fn synthesize(&self, portrait: &[u8], audio: &[u8]) -> CollabResult<SynthesisOutput>;
}

/// Output of a background matting call.
#[derive(Debug, Clone)]
pub struct MattingOutput {
    /// Matted image bytes, background removed.
    pub image: Vec<u8>,
    /// Fraction of pixels kept by the foreground mask (0.0 - 1.0).
    pub mask_coverage: f32,
}

/// Output of a synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    /// Encoded video bytes.
    pub video: Vec<u8>,
    /// Wall-clock render time as measured by the client.
    pub render_time_ms: u64,
}

/// Map a non-success HTTP status onto the collaborator contract.
///
/// 429 and 503 mean the service exists but cannot take work right now;
/// anything else non-2xx means the request ran and failed.
pub(crate) fn status_error(
    service: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> CollaboratorError {
    let reason = format!("status {}: {}", status.as_u16(), truncate(body, 200));
    if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        CollaboratorError::unavailable(service, reason)
    } else {
        CollaboratorError::inference(service, reason)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Serde adapter for byte fields carried as base64 strings in JSON bodies.
pub(crate) mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        BASE64_STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_mapping() {
        let err = status_error("person-detection", reqwest::StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(matches!(err, CollaboratorError::ServiceUnavailable { .. }));

        let err = status_error(
            "person-detection",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "cuda out of memory",
        );
        match err {
            CollaboratorError::InferenceError { reason, .. } => {
                assert!(reason.contains("status 500"));
                assert!(reason.contains("cuda out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 2), "he");
        // Multi-byte characters are never split.
        assert_eq!(truncate("héllo", 2), "hé");
    }

    #[test]
    fn test_base64_bytes_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Payload {
            #[serde(with = "base64_bytes")]
            data: Vec<u8>,
        }

        let json = serde_json::to_string(&Payload {
            data: b"portrait".to_vec(),
        })
        .unwrap();
        assert!(json.contains("cG9ydHJhaXQ="));

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, b"portrait");
    }
}
