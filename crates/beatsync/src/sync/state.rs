use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

/// A candidate that passed the confidence gate. Never mutated once recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BeatEvent {
    pub timestamp: f64,
    pub confidence: f32,
    pub strength: f32,
    pub position_in_measure: f32,
    pub tempo_bpm: f32,
    pub time_signature: (u8, u8),
}

/// Phase-locked synchronization state, recomputed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncState {
    pub current_tempo: f32,
    pub last_beat_time: f64,
    pub next_beat_time: f64,
    /// Position within the current beat, in [0, 1).
    pub beat_phase: f32,
    /// Position within the current measure, in [0, 1).
    pub measure_phase: f32,
    pub is_stable: bool,
    pub confidence: f32,
    pub adaptive_threshold: f32,
    pub beats_per_measure: u8,
    /// Whether any beat has been accepted yet. Phases stay 0 until then.
    pub has_beat: bool,
}

/// Confidence above which the tempo lock is considered stable.
pub const STABLE_CONFIDENCE: f32 = 0.8;

impl SyncState {
    /// State before any beat has been seen.
    pub fn initial(tempo: f32, adaptive_threshold: f32, beats_per_measure: u8) -> Self {
        Self {
            current_tempo: tempo,
            last_beat_time: 0.0,
            next_beat_time: 0.0,
            beat_phase: 0.0,
            measure_phase: 0.0,
            is_stable: false,
            confidence: 0.0,
            adaptive_threshold,
            beats_per_measure: beats_per_measure.max(1),
            has_beat: false,
        }
    }

    /// Derive the state at audio time `now` from the latest beat.
    pub fn derive(
        tempo: f32,
        confidence: f32,
        adaptive_threshold: f32,
        beats_per_measure: u8,
        last_beat: Option<f64>,
        now: f64,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut state = Self::initial(tempo, adaptive_threshold, beats_per_measure);
        state.confidence = confidence;
        state.is_stable = confidence > STABLE_CONFIDENCE;
        if let Some(last) = last_beat {
            state.has_beat = true;
            state.last_beat_time = last;
            state.project(now);
        }
        state
    }

    /// Copy of this state with phases and next beat re-derived for `now`.
    /// Lets consumers running faster than the hop rate stay phase-locked.
    pub fn at(&self, now: f64) -> Self {
        let mut state = *self;
        if state.has_beat {
            state.project(now);
        }
        state
    }

    pub fn beat_interval(&self) -> f64 {
        if self.current_tempo > 0.0 {
            60.0 / f64::from(self.current_tempo)
        } else {
            0.0
        }
    }

    fn project(&mut self, now: f64) {
        let beat_interval = self.beat_interval();
        let measure_interval = beat_interval * f64::from(self.beats_per_measure.max(1));
        let elapsed = now - self.last_beat_time;

        self.beat_phase = phase_of(elapsed, beat_interval);
        self.measure_phase = phase_of(elapsed, measure_interval);
        self.next_beat_time = if beat_interval > 0.0 && elapsed >= 0.0 {
            self.last_beat_time + beat_interval * ((elapsed / beat_interval).floor() + 1.0)
        } else {
            self.last_beat_time
        };
    }
}

/// Fractional position of `elapsed` within `period`, always in [0, 1).
pub fn phase_of(elapsed: f64, period: f64) -> f32 {
    if period <= 0.0 || !period.is_finite() || !elapsed.is_finite() {
        return 0.0;
    }
    let phase = (elapsed.rem_euclid(period) / period) as f32;
    // Rounding to f32 can land exactly on 1.0.
    if (0.0..1.0).contains(&phase) {
        phase
    } else {
        0.0
    }
}

/// Cloneable, thread-safe reader of the most recently published state.
///
/// The processing thread swaps in a new immutable snapshot each frame;
/// readers never block it and never see a half-written state.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<ArcSwap<SyncState>>,
}

impl SyncHandle {
    pub(crate) fn new(initial: SyncState) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub(crate) fn publish(&self, state: SyncState) {
        self.inner.store(Arc::new(state));
    }

    pub fn snapshot(&self) -> SyncState {
        **self.inner.load()
    }

    /// Latest snapshot projected to `now`.
    pub fn snapshot_at(&self, now: f64) -> SyncState {
        self.snapshot().at(now)
    }
}
