//! Progress accounting for pipeline stages.
//!
//! Each phase of a run owns a fixed window of the progress bar regardless of
//! how long it actually takes: detection 0-20, background removal 20-40,
//! synthesis 40-80, finalization 80-100. Entering a phase reports the window
//! start and completing it reports the window end, so clients can render a
//! bar that only ever moves forward. Runs that skip synthesis jump straight
//! from 40 to 80 when finalization begins.

use portray_types::PipelineStage;

/// Progress percent reported for a stage transition.
///
/// Returns `None` for `Failed` and `Cancelled`: terminal failure keeps
/// whatever percent the run had reached rather than inventing one.
pub fn stage_percent(stage: PipelineStage) -> Option<u8> {
    match stage {
        PipelineStage::Initialized
        | PipelineStage::UploadComplete
        | PipelineStage::DetectionRunning => Some(0),
        PipelineStage::DetectionComplete | PipelineStage::BackgroundRemovalRunning => Some(20),
        PipelineStage::BackgroundRemovalComplete | PipelineStage::SynthesisRunning => Some(40),
        PipelineStage::SynthesisComplete | PipelineStage::Finalizing => Some(80),
        PipelineStage::Completed => Some(100),
        PipelineStage::Failed | PipelineStage::Cancelled => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_PATH: [PipelineStage; 10] = [
        PipelineStage::Initialized,
        PipelineStage::UploadComplete,
        PipelineStage::DetectionRunning,
        PipelineStage::DetectionComplete,
        PipelineStage::BackgroundRemovalRunning,
        PipelineStage::BackgroundRemovalComplete,
        PipelineStage::SynthesisRunning,
        PipelineStage::SynthesisComplete,
        PipelineStage::Finalizing,
        PipelineStage::Completed,
    ];

    #[test]
    fn test_full_path_is_non_decreasing() {
        let mut last = 0u8;
        for stage in FULL_PATH {
            let pct = stage_percent(stage).unwrap();
            assert!(pct >= last, "{stage} regressed from {last} to {pct}");
            last = pct;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_synthesis_skip_jumps_forward() {
        // Matting-only runs go straight from 40 to the finalize window.
        let before = stage_percent(PipelineStage::BackgroundRemovalComplete).unwrap();
        let after = stage_percent(PipelineStage::Finalizing).unwrap();
        assert_eq!(before, 40);
        assert_eq!(after, 80);
    }

    #[test]
    fn test_window_boundaries() {
        assert_eq!(stage_percent(PipelineStage::DetectionRunning), Some(0));
        assert_eq!(stage_percent(PipelineStage::DetectionComplete), Some(20));
        assert_eq!(stage_percent(PipelineStage::SynthesisRunning), Some(40));
        assert_eq!(stage_percent(PipelineStage::SynthesisComplete), Some(80));
        assert_eq!(stage_percent(PipelineStage::Completed), Some(100));
    }

    #[test]
    fn test_terminal_failures_keep_last_percent() {
        assert_eq!(stage_percent(PipelineStage::Failed), None);
        assert_eq!(stage_percent(PipelineStage::Cancelled), None);
    }
}
