use serde::Serialize;

use super::ring::RingBuffer;

/// Windowed mean/variance entries kept for threshold adaptation.
pub const STATS_HISTORY: usize = 20;

/// A local maximum of the onset stream that cleared the adaptive threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BeatCandidate {
    /// When the peak occurred (already back-dated), in seconds.
    pub timestamp: f64,
    pub strength: f32,
    /// `strength / threshold`, capped at 1.
    pub confidence: f32,
}

/// Finds statistically significant local maxima in the onset-strength stream.
///
/// The threshold follows `mean + 2·stddev` of recent peak windows through an
/// exponential moving average, so it only moves when a local maximum is seen
/// (including ones that fail the threshold, which lets it sink during quiet
/// passages).
pub struct AdaptivePeakPicker {
    window: RingBuffer<f32>,
    window_size: usize,
    mean_history: RingBuffer<f64>,
    variance_history: RingBuffer<f64>,
    threshold: f32,
    initial_threshold: f32,
    alpha: f32,
    hop_seconds: f64,
}

impl AdaptivePeakPicker {
    /// `window_size` should be odd so the window has a true center.
    pub fn new(window_size: usize, initial_threshold: f32, alpha: f32, hop_seconds: f64) -> Self {
        let window_size = window_size.max(3);
        Self {
            window: RingBuffer::new(window_size),
            window_size,
            mean_history: RingBuffer::new(STATS_HISTORY),
            variance_history: RingBuffer::new(STATS_HISTORY),
            threshold: initial_threshold,
            initial_threshold,
            alpha: alpha.clamp(0.0, 1.0),
            hop_seconds: hop_seconds.max(0.0),
        }
    }

    fn center_index(&self) -> usize {
        self.window_size / 2
    }

    /// Feed one onset value. Returns a candidate when the window center is a
    /// strict local maximum above the (freshly adapted) threshold.
    pub fn detect_peak(&mut self, value: f32, timestamp: f64) -> Option<BeatCandidate> {
        let value = if value.is_finite() { value } else { 0.0 };
        self.window.push(value);
        if !self.window.is_full() {
            return None;
        }

        let center_idx = self.center_index();
        let center = self.window.get(center_idx)?;
        let is_local_max = self
            .window
            .iter()
            .enumerate()
            .all(|(i, v)| i == center_idx || center > v);
        if !is_local_max {
            return None;
        }

        // Report the peak when it happened, not when the lookahead arrived.
        let lag_hops = (self.window_size - center_idx - 1) as f64;
        let peak_time = timestamp - lag_hops * self.hop_seconds;

        self.adapt_threshold();

        if center <= self.threshold {
            return None;
        }
        let confidence = if self.threshold > f32::EPSILON {
            (center / self.threshold).min(1.0)
        } else {
            1.0
        };
        Some(BeatCandidate {
            timestamp: peak_time,
            strength: center,
            confidence,
        })
    }

    fn adapt_threshold(&mut self) {
        let n = self.window.len() as f64;
        let mean = self.window.iter().map(f64::from).sum::<f64>() / n;
        let variance = self
            .window
            .iter()
            .map(|v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / n;

        self.mean_history.push(mean);
        self.variance_history.push(variance);

        let avg_mean =
            self.mean_history.iter().sum::<f64>() / self.mean_history.len() as f64;
        let avg_variance =
            self.variance_history.iter().sum::<f64>() / self.variance_history.len() as f64;
        let target = (avg_mean + 2.0 * avg_variance.sqrt()) as f32;

        let alpha = self.alpha;
        let next = self.threshold * (1.0 - alpha) + target * alpha;
        if next.is_finite() {
            self.threshold = next.max(0.0);
        }
    }

    pub fn get_threshold(&self) -> f32 {
        self.threshold
    }

    /// Seconds between consecutive onset values.
    pub fn hop_seconds(&self) -> f64 {
        self.hop_seconds
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.mean_history.clear();
        self.variance_history.clear();
        self.threshold = self.initial_threshold;
    }
}
