use thiserror::Error;

/// Rejected configuration. The engine keeps its previous configuration when
/// an update fails with one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid tempo range: min_tempo ({min}) must be positive and below max_tempo ({max})")]
    InvalidTempoRange { min: f32, max: f32 },

    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("adaptive_peak_window_size must be odd so the window has a center sample, got {0}")]
    EvenWindow(usize),
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, value: impl Into<f64>, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.into(),
            expected,
        }
    }
}
