//! Beat detection stages: OnsetDetector → AdaptivePeakPicker → TempoTracker.

pub mod onset;
pub mod peak;
pub mod ring;
pub mod stats;
pub mod tempo;

pub use onset::{OnsetDetector, OnsetFunction};
pub use peak::{AdaptivePeakPicker, BeatCandidate};
pub use tempo::{BeatRejection, TempoEstimate, TempoTracker};

/// One hop of spectral analysis, as produced by the spectral frontend.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFrame {
    /// Magnitude per frequency bin.
    pub magnitudes: Vec<f32>,
    /// Phase per frequency bin in radians, when the frontend provides it.
    pub phase: Option<Vec<f32>>,
    /// Audio clock time of the frame, in seconds.
    pub timestamp: f64,
}

impl AnalysisFrame {
    pub fn new(magnitudes: Vec<f32>, phase: Option<Vec<f32>>, timestamp: f64) -> Self {
        Self {
            magnitudes,
            phase,
            timestamp,
        }
    }
}
