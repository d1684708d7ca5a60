//! Mock collaborators for tests.
//!
//! Every mock counts its calls and can be told to fail with any of the
//! three contract errors. `MockMatter` additionally takes a one-shot hook
//! that runs inside the call, which is how tests trigger cancellation
//! while a stage is in flight.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use portray_types::{BoundingBox, Detection};

use crate::collab::{
    BackgroundMatter, MattingOutput, PersonDetector, SpeechSynthesizer, SynthesisOutput,
};
use crate::error::{CollabResult, CollaboratorError};

/// Which contract error a mock should raise.
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    Unavailable,
    Inference,
    Timeout,
}

impl MockFailure {
    fn into_error(self, service: &str) -> CollaboratorError {
        match self {
            Self::Unavailable => {
                CollaboratorError::unavailable(service, "mock: connection refused")
            }
            Self::Inference => CollaboratorError::inference(service, "mock: model exploded"),
            Self::Timeout => CollaboratorError::timeout(service, 1_000),
        }
    }
}

/// A detection covering `width` x `height` pixels at the origin.
pub fn detection(width: f32, height: f32, confidence: f32) -> Detection {
    Detection {
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            width,
            height,
        },
        confidence,
    }
}

/// Person detector returning a canned detection list.
#[derive(Default)]
pub struct MockDetector {
    detections: Vec<Detection>,
    fail_with: Option<MockFailure>,
    calls: AtomicUsize,
}

impl MockDetector {
    pub fn returning(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            ..Self::default()
        }
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            fail_with: Some(failure),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonDetector for MockDetector {
    async fn detect(&self, _image: &[u8]) -> CollabResult<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(failure) => Err(failure.into_error(crate::collab::detection::SERVICE)),
            None => Ok(self.detections.clone()),
        }
    }
}

/// Background matter returning a canned matte.
#[derive(Default)]
pub struct MockMatter {
    fail_with: Option<MockFailure>,
    calls: AtomicUsize,
    on_call: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MockMatter {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            fail_with: Some(failure),
            ..Self::default()
        }
    }

    /// Run `hook` inside the next `remove_background` call.
    pub fn with_hook(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_call.lock() = Some(Box::new(hook));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundMatter for MockMatter {
    async fn remove_background(
        &self,
        _image: &[u8],
        _subject: &BoundingBox,
    ) -> CollabResult<MattingOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_call.lock().take() {
            hook();
        }
        match self.fail_with {
            Some(failure) => Err(failure.into_error(crate::collab::matting::SERVICE)),
            None => Ok(MattingOutput {
                image: b"matted-portrait".to_vec(),
                mask_coverage: 0.42,
            }),
        }
    }
}

/// Synthesizer returning a canned video.
#[derive(Default)]
pub struct MockSynthesizer {
    fail_with: Option<MockFailure>,
    calls: AtomicUsize,
}

impl MockSynthesizer {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(failure: MockFailure) -> Self {
        Self {
            fail_with: Some(failure),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, _portrait: &[u8], _audio: &[u8]) -> CollabResult<SynthesisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(failure) => Err(failure.into_error(crate::collab::synthesis::SERVICE)),
            None => Ok(SynthesisOutput {
                video: b"rendered-video".to_vec(),
                render_time_ms: 42,
            }),
        }
    }
}
