use serde::Serialize;

use super::ring::RingBuffer;
use super::stats;

pub const DEFAULT_TEMPO: f32 = 120.0;
/// Accepted beat timestamps kept for interval analysis.
pub const BEAT_HISTORY: usize = 8;
/// Per-update tempo values averaged into the published tempo.
pub const SMOOTHING_HISTORY: usize = 5;
/// Confidence reported until enough tempo values exist to judge stability.
const NEUTRAL_CONFIDENCE: f32 = 0.5;

/// Why [`TempoTracker::try_update`] dropped a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatRejection {
    /// Interval shorter than `max_tempo` allows, or not positive.
    TooSoon,
    /// Interval longer than `min_tempo` allows.
    TooLate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TempoEstimate {
    pub bpm: f32,
    pub confidence: f32,
}

/// Robust tempo estimate from accepted beat timestamps.
///
/// Two smoothing stages: the median of IQR-filtered intervals absorbs single
/// jittery intervals, then the mean of the last few medians absorbs
/// short-term drift.
pub struct TempoTracker {
    beats: RingBuffer<f64>,
    tempo_history: RingBuffer<f64>,
    current_tempo: f32,
    confidence: f32,
    min_tempo: f32,
    max_tempo: f32,
    /// Scratch buffer reused across updates.
    intervals: Vec<f64>,
}

impl TempoTracker {
    pub fn new(min_tempo: f32, max_tempo: f32) -> Self {
        Self {
            beats: RingBuffer::new(BEAT_HISTORY),
            tempo_history: RingBuffer::new(SMOOTHING_HISTORY),
            current_tempo: DEFAULT_TEMPO.clamp(min_tempo, max_tempo),
            confidence: 0.0,
            min_tempo,
            max_tempo,
            intervals: Vec::with_capacity(BEAT_HISTORY),
        }
    }

    /// Register an accepted beat and return the current tempo.
    ///
    /// A beat whose implied instantaneous tempo is outside the configured
    /// bounds (double trigger, missed beat, time going backwards) is dropped
    /// without touching any state.
    pub fn update_tempo(&mut self, beat_timestamp: f64) -> f32 {
        self.try_update(beat_timestamp).unwrap_or(self.current_tempo)
    }

    /// Like [`update_tempo`](Self::update_tempo), but reports why a beat was
    /// dropped.
    pub fn try_update(&mut self, beat_timestamp: f64) -> Result<f32, BeatRejection> {
        let Some(last) = self.beats.last() else {
            self.beats.push(beat_timestamp);
            return Ok(self.current_tempo);
        };

        let interval = beat_timestamp - last;
        if interval <= 0.0 || !interval.is_finite() {
            log::debug!("Rejecting beat at {beat_timestamp:.3}s: non-positive interval");
            return Err(BeatRejection::TooSoon);
        }
        let implied = 60.0 / interval;
        if implied > f64::from(self.max_tempo) {
            log::debug!("Rejecting beat at {beat_timestamp:.3}s: implied {implied:.1} BPM");
            return Err(BeatRejection::TooSoon);
        }
        if implied < f64::from(self.min_tempo) {
            log::debug!("Rejecting beat at {beat_timestamp:.3}s: implied {implied:.1} BPM");
            return Err(BeatRejection::TooLate);
        }

        self.beats.push(beat_timestamp);
        self.current_tempo = self.calculate_tempo();
        self.update_confidence();
        Ok(self.current_tempo)
    }

    /// Restart interval analysis at `beat_timestamp` after a gap, keeping the
    /// tempo estimate and its smoothing history.
    pub fn rebase(&mut self, beat_timestamp: f64) {
        self.beats.clear();
        self.beats.push(beat_timestamp);
    }

    fn calculate_tempo(&mut self) -> f32 {
        if self.beats.len() < 2 {
            return self.current_tempo;
        }

        self.intervals.clear();
        let mut prev = None;
        for ts in self.beats.iter() {
            if let Some(p) = prev {
                self.intervals.push(ts - p);
            }
            prev = Some(ts);
        }
        stats::sort(&mut self.intervals);

        let (q1, q3) = stats::quartiles_sorted(&self.intervals);
        let iqr = q3 - q1;
        let (lo, hi) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);
        self.intervals.retain(|&i| i >= lo && i <= hi);
        if self.intervals.is_empty() {
            return self.current_tempo;
        }

        let median = stats::median_sorted(&self.intervals);
        if median <= 0.0 {
            return self.current_tempo;
        }
        self.tempo_history.push(60.0 / median);

        let smoothed = self.tempo_history.iter().sum::<f64>() / self.tempo_history.len() as f64;
        (smoothed as f32).clamp(self.min_tempo, self.max_tempo)
    }

    fn update_confidence(&mut self) {
        if self.tempo_history.len() < 3 {
            self.confidence = NEUTRAL_CONFIDENCE;
            return;
        }
        self.tempo_history.copy_into(&mut self.intervals);
        let variance = stats::variance_about(&self.intervals, f64::from(self.current_tempo));
        let confidence = (1.0 - variance / 100.0).clamp(0.0, 1.0) as f32;
        self.confidence = if confidence.is_finite() { confidence } else { 0.0 };
    }

    pub fn get_current_tempo(&self) -> f32 {
        self.current_tempo
    }

    pub fn get_confidence(&self) -> f32 {
        self.confidence
    }

    pub fn estimate(&self) -> TempoEstimate {
        TempoEstimate {
            bpm: self.current_tempo,
            confidence: self.confidence,
        }
    }

    pub fn bounds(&self) -> (f32, f32) {
        (self.min_tempo, self.max_tempo)
    }

    /// Number of beats currently held for interval analysis.
    pub fn beat_count(&self) -> usize {
        self.beats.len()
    }

    /// Forget all beats. The tempo returns to 120 BPM, clamped into the
    /// configured bounds when 120 lies outside them; confidence returns to 0.
    pub fn reset(&mut self) {
        self.beats.clear();
        self.tempo_history.clear();
        self.current_tempo = DEFAULT_TEMPO.clamp(self.min_tempo, self.max_tempo);
        self.confidence = 0.0;
    }
}
