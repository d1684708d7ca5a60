//! Subject selection among person detections.

use portray_types::{Detection, PersonSelection};
use tracing::debug;

use crate::error::{PipelineError, StageResult, ValidationError};

/// Pick the subject detection for the rest of the pipeline.
///
/// Detections below `min_confidence` are never selectable. With
/// `LargestBoundingBox` the qualifying detection with the greatest bbox area
/// wins; on equal areas the earliest detection in the list wins. An explicit
/// `Index` must be in range for the full detection list and still meet the
/// confidence floor.
///
/// Returns the index into `detections` together with the chosen detection.
///
/// # Errors
/// `NoSubjectFound` when nothing qualifies, `Validation` when an explicit
/// index is out of range.
pub fn select_subject(
    detections: &[Detection],
    selection: PersonSelection,
    min_confidence: f32,
) -> StageResult<(usize, Detection)> {
    if detections.is_empty() {
        return Err(PipelineError::NoSubjectFound(
            "no persons detected in image".to_string(),
        ));
    }

    match selection {
        PersonSelection::Index(index) => {
            let det = detections.get(index).ok_or(PipelineError::Validation(
                ValidationError::PersonIndexOutOfRange {
                    index,
                    count: detections.len(),
                },
            ))?;
            if det.confidence < min_confidence {
                return Err(PipelineError::NoSubjectFound(format!(
                    "selected person {} has confidence {:.2}, below threshold {:.2}",
                    index, det.confidence, min_confidence
                )));
            }
            debug!(index, confidence = det.confidence, "subject selected by index");
            Ok((index, det.clone()))
        }
        PersonSelection::LargestBoundingBox => {
            let mut best: Option<(usize, &Detection)> = None;
            for (i, det) in detections.iter().enumerate() {
                if det.confidence < min_confidence {
                    continue;
                }
                // Strict greater-than keeps the earliest detection on ties.
                let better = match best {
                    Some((_, cur)) => det.bbox.area() > cur.bbox.area(),
                    None => true,
                };
                if better {
                    best = Some((i, det));
                }
            }
            match best {
                Some((i, det)) => {
                    debug!(
                        index = i,
                        area = det.bbox.area(),
                        confidence = det.confidence,
                        candidates = detections.len(),
                        "subject selected by largest bounding box"
                    );
                    Ok((i, det.clone()))
                }
                None => Err(PipelineError::NoSubjectFound(format!(
                    "{} detections, none at or above confidence {:.2}",
                    detections.len(),
                    min_confidence
                ))),
            }
        }
    }
}
