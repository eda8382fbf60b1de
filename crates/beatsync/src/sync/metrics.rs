use std::time::Duration;

use serde::Serialize;

use super::state::BeatEvent;
use crate::beat::ring::RingBuffer;
use crate::beat::stats;

/// Events considered for accuracy and stability.
const RECENT_EVENTS: usize = 10;

/// Running pipeline diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SyncMetrics {
    /// Mean confidence of the last 10 accepted beats.
    pub accuracy: f32,
    /// Detection lag of the last beat (frame time minus beat time), ms.
    pub latency_ms: f32,
    /// `1 - stddev/mean` of the last 10 beat intervals, clamped to [0, 1].
    pub stability: f32,
    /// Wall-clock cost of the last processed frame, ms.
    pub processing_time_ms: f32,
    pub total_beats: u64,
    /// Estimated beats that fell into gaps longer than 1.5 beat intervals.
    pub missed_beats: u64,
    /// Candidates rejected by the confidence gate, plus recorded beats that
    /// came too soon after the previous one (suspected double triggers).
    pub false_positives: u64,
    /// Scorer calls that errored, timed out or were skipped while busy.
    pub scorer_skips: u64,
    pub frames_processed: u64,
}

pub(crate) struct MetricsTracker {
    metrics: SyncMetrics,
    confidences: RingBuffer<f64>,
    intervals: RingBuffer<f64>,
    last_beat: Option<f64>,
    scratch: Vec<f64>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            metrics: SyncMetrics::default(),
            confidences: RingBuffer::new(RECENT_EVENTS),
            intervals: RingBuffer::new(RECENT_EVENTS - 1),
            last_beat: None,
            scratch: Vec::with_capacity(RECENT_EVENTS),
        }
    }

    pub fn snapshot(&self) -> SyncMetrics {
        self.metrics
    }

    pub fn record_frame(&mut self, elapsed: Duration) {
        self.metrics.frames_processed += 1;
        self.metrics.processing_time_ms = elapsed.as_secs_f32() * 1000.0;
    }

    pub fn record_rejection(&mut self) {
        self.metrics.false_positives += 1;
    }

    pub fn record_scorer_skip(&mut self) {
        self.metrics.scorer_skips += 1;
    }

    pub fn record_beat(&mut self, event: &BeatEvent, detected_at: f64) {
        let m = &mut self.metrics;
        m.total_beats += 1;
        m.latency_ms = ((detected_at - event.timestamp).max(0.0) * 1000.0) as f32;

        if let Some(prev) = self.last_beat {
            let interval = event.timestamp - prev;
            if interval > 0.0 {
                self.intervals.push(interval);
                let beat_interval = 60.0 / f64::from(event.tempo_bpm.max(1.0));
                if interval > 1.5 * beat_interval {
                    let skipped = (interval / beat_interval).round() - 1.0;
                    m.missed_beats += skipped.max(0.0) as u64;
                }
            }
        }
        self.last_beat = Some(event.timestamp);

        self.confidences.push(f64::from(event.confidence));
        self.confidences.copy_into(&mut self.scratch);
        m.accuracy = (stats::mean(&self.scratch) as f32).clamp(0.0, 1.0);

        self.intervals.copy_into(&mut self.scratch);
        m.stability = if self.scratch.len() >= 2 {
            let mean = stats::mean(&self.scratch);
            let cv = stats::variance(&self.scratch).sqrt() / mean;
            (1.0 - cv).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
    }

    pub fn reset(&mut self) {
        self.metrics = SyncMetrics::default();
        self.confidences.clear();
        self.intervals.clear();
        self.last_beat = None;
    }
}
