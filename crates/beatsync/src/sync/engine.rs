use std::time::Instant;

use crate::beat::ring::RingBuffer;
use crate::beat::{
    AdaptivePeakPicker, AnalysisFrame, BeatCandidate, BeatRejection, OnsetDetector, TempoEstimate,
    TempoTracker,
};
use crate::config::{SyncConfig, SyncConfigUpdate};
use crate::error::ConfigError;

use super::metrics::{MetricsTracker, SyncMetrics};
use super::scorer::{
    BeatScore, BeatScorer, FeatureContext, INTERVAL_FEATURES, ONSET_FEATURES, ScorerWorker,
    build_features,
};
use super::state::{BeatEvent, SyncHandle, SyncState};

/// Per-frame beat pipeline: onset → peak picking → (scorer) → gate → tempo →
/// published sync state.
///
/// One engine serves one audio stream. Frames must arrive in order; the
/// engine keeps no clock of its own and uses frame timestamps throughout.
pub struct SyncEngine {
    config: SyncConfig,
    onset: OnsetDetector,
    picker: AdaptivePeakPicker,
    tempo: TempoTracker,
    scorer: Option<ScorerWorker>,
    history: RingBuffer<BeatEvent>,
    /// Recent onset strengths for the scorer's feature vector.
    onsets: RingBuffer<f32>,
    spectrum: Vec<f32>,
    beat_times: Vec<f64>,
    metrics: MetricsTracker,
    last_event: Option<BeatEvent>,
    state: SyncState,
    handle: SyncHandle,
    clock: f64,
    disposed: bool,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tempo = TempoTracker::new(config.min_tempo, config.max_tempo);
        let state = SyncState::initial(
            tempo.get_current_tempo(),
            config.initial_threshold,
            config.beats_per_measure,
        );
        log::info!(
            "Sync engine: {} Hz, hop {}, {:?}, {:.0}-{:.0} BPM",
            config.sample_rate,
            config.hop_size,
            config.onset_function,
            config.min_tempo,
            config.max_tempo
        );
        Ok(Self {
            onset: OnsetDetector::new(config.onset_function),
            picker: build_picker(&config),
            tempo,
            scorer: None,
            history: RingBuffer::new(config.history_capacity),
            onsets: RingBuffer::new(ONSET_FEATURES),
            spectrum: Vec::new(),
            beat_times: Vec::with_capacity(INTERVAL_FEATURES + 1),
            metrics: MetricsTracker::new(),
            last_event: None,
            state,
            handle: SyncHandle::new(state),
            clock: 0.0,
            disposed: false,
            config,
        })
    }

    pub fn with_scorer(config: SyncConfig, scorer: Box<dyn BeatScorer>) -> anyhow::Result<Self> {
        let mut engine = Self::new(config)?;
        engine.set_scorer(scorer)?;
        Ok(engine)
    }

    /// Install a scorer, replacing (and shutting down) any previous one.
    pub fn set_scorer(&mut self, scorer: Box<dyn BeatScorer>) -> anyhow::Result<()> {
        if self.disposed {
            anyhow::bail!("engine has been disposed");
        }
        let worker = ScorerWorker::spawn(scorer)?;
        if let Some(mut old) = self.scorer.replace(worker) {
            old.shutdown();
        }
        Ok(())
    }

    pub fn clear_scorer(&mut self) {
        if let Some(mut old) = self.scorer.take() {
            old.shutdown();
        }
    }

    pub fn scorer_name(&self) -> Option<&str> {
        self.scorer.as_ref().map(ScorerWorker::name)
    }

    /// Run one analysis frame through the pipeline. Returns the beat event
    /// accepted on this frame, if any.
    pub fn process_frame(&mut self, frame: &AnalysisFrame) -> Option<BeatEvent> {
        if self.disposed {
            return None;
        }
        let start = Instant::now();
        let strength = self.onset.process(frame);
        self.spectrum.clear();
        self.spectrum.extend_from_slice(&frame.magnitudes);
        let event = self.step(strength, frame.timestamp);
        self.metrics.record_frame(start.elapsed());
        event
    }

    /// Run a precomputed onset strength through the rest of the pipeline.
    pub fn process_onset(&mut self, strength: f32, timestamp: f64) -> Option<BeatEvent> {
        if self.disposed {
            return None;
        }
        let start = Instant::now();
        self.spectrum.clear();
        let event = self.step(strength, timestamp);
        self.metrics.record_frame(start.elapsed());
        event
    }

    fn step(&mut self, strength: f32, now: f64) -> Option<BeatEvent> {
        let strength = if strength.is_finite() { strength.max(0.0) } else { 0.0 };
        let now = if now.is_finite() { now } else { self.clock };
        self.clock = now;
        self.onsets.push(strength);

        let event = self
            .picker
            .detect_peak(strength, now)
            .and_then(|candidate| self.promote(&candidate, now));
        self.publish();
        event
    }

    fn promote(&mut self, candidate: &BeatCandidate, now: f64) -> Option<BeatEvent> {
        let mut confidence = candidate.confidence;
        let mut tempo_factor = 1.0;
        if let Some(score) = self.consult_scorer(candidate) {
            confidence *= score.beat_probability;
            tempo_factor = score.tempo_factor();
        }

        if confidence < self.config.confidence_threshold {
            log::trace!(
                "Candidate at {:.3}s below confidence gate ({confidence:.2})",
                candidate.timestamp
            );
            self.metrics.record_rejection();
            return None;
        }

        let tempo = match self.tempo.try_update(candidate.timestamp) {
            Ok(tempo) => tempo,
            // Suspected double trigger: keep the event, leave the tempo alone.
            Err(BeatRejection::TooSoon) => {
                self.metrics.record_rejection();
                self.tempo.get_current_tempo()
            }
            // A real beat after a pause. Without the rebase every later beat
            // would be measured against the stale one and rejected too.
            Err(BeatRejection::TooLate) => {
                log::debug!("Beat gap before {:.3}s, restarting interval analysis", candidate.timestamp);
                self.tempo.rebase(candidate.timestamp);
                self.tempo.get_current_tempo()
            }
        };
        let (min_tempo, max_tempo) = self.tempo.bounds();
        let tempo_bpm = (tempo * tempo_factor).clamp(min_tempo, max_tempo);

        let position_in_measure = match self.last_event {
            Some(prev) => {
                let beat_interval = 60.0 / f64::from(tempo_bpm);
                super::state::phase_of(candidate.timestamp - prev.timestamp, beat_interval)
            }
            None => 0.0,
        };

        let event = BeatEvent {
            timestamp: candidate.timestamp,
            confidence: confidence.clamp(0.0, 1.0),
            strength: candidate.strength,
            position_in_measure,
            tempo_bpm,
            time_signature: (self.config.beats_per_measure, 4),
        };
        self.history.push(event);
        self.metrics.record_beat(&event, now);
        self.last_event = Some(event);
        log::debug!(
            "Beat at {:.3}s: {:.1} BPM, confidence {:.2}",
            event.timestamp,
            event.tempo_bpm,
            event.confidence
        );
        Some(event)
    }

    fn consult_scorer(&mut self, candidate: &BeatCandidate) -> Option<BeatScore> {
        if self.scorer.is_none() {
            return None;
        }

        self.beat_times.clear();
        let skip = self.history.len().saturating_sub(INTERVAL_FEATURES + 1);
        self.beat_times
            .extend(self.history.iter().skip(skip).map(|e| e.timestamp));

        let features = build_features(&FeatureContext {
            spectrum: &self.spectrum,
            onsets: &self.onsets,
            state: &self.state,
            candidate,
            max_tempo: self.config.max_tempo,
            beat_times: &self.beat_times,
        });

        let timeout = self.config.scorer_timeout();
        let worker = self.scorer.as_mut()?;
        match worker.score(features, timeout) {
            Ok(score) => Some(score),
            Err(skip) => {
                log::warn!("Scoring beat at {:.3}s skipped: {skip}", candidate.timestamp);
                self.metrics.record_scorer_skip();
                None
            }
        }
    }

    fn publish(&mut self) {
        let (min_tempo, max_tempo) = self.tempo.bounds();
        let tempo = self
            .last_event
            .map_or(self.tempo.get_current_tempo(), |e| e.tempo_bpm)
            .clamp(min_tempo, max_tempo);
        self.state = SyncState::derive(
            tempo,
            self.tempo.get_confidence(),
            self.picker.get_threshold(),
            self.config.beats_per_measure,
            self.last_event.map(|e| e.timestamp),
            self.clock,
        );
        self.handle.publish(self.state);
    }

    /// State as of the most recent frame.
    pub fn get_sync_state(&self) -> SyncState {
        self.state
    }

    /// Reader for other threads. Stays valid after the engine is dropped and
    /// then keeps returning the last published state.
    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Up to `n` most recent beat events, oldest first.
    pub fn get_recent_beats(&self, n: usize) -> Vec<BeatEvent> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).collect()
    }

    pub fn get_metrics(&self) -> SyncMetrics {
        self.metrics.snapshot()
    }

    pub fn tempo_estimate(&self) -> TempoEstimate {
        self.tempo.estimate()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Apply a partial configuration change. On error nothing changes.
    ///
    /// Changing the tempo bounds restarts tempo tracking; changing any peak
    /// picker parameter restarts peak picking; changing the onset function
    /// restarts onset detection. Beat history and metrics are kept.
    pub fn update_config(&mut self, update: &SyncConfigUpdate) -> Result<(), ConfigError> {
        let next = update.apply_to(&self.config)?;
        let prev = &self.config;

        if next.min_tempo != prev.min_tempo || next.max_tempo != prev.max_tempo {
            log::info!(
                "Tempo range changed to {:.0}-{:.0} BPM",
                next.min_tempo,
                next.max_tempo
            );
            self.tempo = TempoTracker::new(next.min_tempo, next.max_tempo);
        }

        let picker_changed = next.adaptive_peak_window_size != prev.adaptive_peak_window_size
            || next.adaptive_peak_alpha != prev.adaptive_peak_alpha
            || next.initial_threshold != prev.initial_threshold
            || next.hop_size != prev.hop_size
            || next.sample_rate != prev.sample_rate;
        if picker_changed {
            self.picker = build_picker(&next);
        }

        if next.onset_function != prev.onset_function {
            log::info!("Onset function changed to {:?}", next.onset_function);
            self.onset = OnsetDetector::new(next.onset_function);
        }

        if next.history_capacity != prev.history_capacity {
            let mut history = RingBuffer::new(next.history_capacity);
            for event in self.history.iter() {
                history.push(event);
            }
            self.history = history;
        }

        self.config = next;
        self.publish();
        Ok(())
    }

    /// Back to the freshly constructed state, keeping configuration and
    /// scorer.
    pub fn reset(&mut self) {
        self.onset.reset();
        self.picker.reset();
        self.tempo.reset();
        self.history.clear();
        self.onsets.clear();
        self.spectrum.clear();
        self.metrics.reset();
        self.last_event = None;
        self.clock = 0.0;
        self.publish();
    }

    /// Stop processing and shut the scorer down. Later frames are ignored.
    /// Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.clear_scorer();
        log::info!(
            "Sync engine disposed after {} beats",
            self.metrics.snapshot().total_beats
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn build_picker(config: &SyncConfig) -> AdaptivePeakPicker {
    AdaptivePeakPicker::new(
        config.adaptive_peak_window_size,
        config.initial_threshold,
        config.adaptive_peak_alpha,
        config.hop_seconds(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::scorer::FeatureVector;

    fn config() -> SyncConfig {
        // 10 ms hops.
        SyncConfig {
            hop_size: 441,
            ..SyncConfig::default()
        }
    }

    /// 0.6 onset pulses every 50 frames (0.5 s), starting at frame 50.
    fn run_pulses(engine: &mut SyncEngine, frames: usize) -> Vec<BeatEvent> {
        (0..=frames)
            .filter_map(|i| {
                let strength = if i > 0 && i % 50 == 0 { 0.6 } else { 0.0 };
                engine.process_onset(strength, i as f64 * 0.01)
            })
            .collect()
    }

    #[test]
    fn invalid_config_rejected() {
        let bad = SyncConfig {
            min_tempo: 200.0,
            max_tempo: 100.0,
            ..config()
        };
        assert!(matches!(
            SyncEngine::new(bad),
            Err(ConfigError::InvalidTempoRange { .. })
        ));
    }

    #[test]
    fn pulses_become_beats() {
        let mut engine = SyncEngine::new(config()).unwrap();
        let events = run_pulses(&mut engine, 520);
        assert_eq!(events.len(), 10);
        assert!((events[0].timestamp - 0.5).abs() < 1e-9);
        assert_eq!(events[0].position_in_measure, 0.0);
        assert_eq!(events[0].time_signature, (4, 4));
        let last = events[events.len() - 1];
        assert!((last.tempo_bpm - 120.0).abs() < 1.0);

        let metrics = engine.get_metrics();
        assert_eq!(metrics.total_beats, 10);
        assert_eq!(metrics.frames_processed, 521);
        assert_eq!(metrics.missed_beats, 0);
        assert!(metrics.accuracy > 0.99);
        assert!(metrics.stability > 0.99);
        // Peaks are confirmed two hops after they happen.
        assert!((metrics.latency_ms - 20.0).abs() < 0.1);
    }

    #[test]
    fn state_tracks_latest_beat() {
        let mut engine = SyncEngine::new(config()).unwrap();
        run_pulses(&mut engine, 520);
        let state = engine.get_sync_state();
        assert!(state.has_beat);
        assert!((state.last_beat_time - 5.0).abs() < 1e-6);
        // Frame 520 is 0.2 s past the beat at 5.0 s.
        assert!((state.beat_phase - 0.4).abs() < 1e-3);
        assert!((state.next_beat_time - 5.5).abs() < 1e-3);
        assert!(state.is_stable);
        assert_eq!(engine.handle().snapshot(), state);
    }

    #[test]
    fn recent_beats_are_chronological_and_bounded() {
        let mut engine = SyncEngine::new(SyncConfig {
            history_capacity: 4,
            ..config()
        })
        .unwrap();
        let events = run_pulses(&mut engine, 520);
        let recent = engine.get_recent_beats(3);
        assert_eq!(recent, events[7..].to_vec());
        assert_eq!(engine.get_recent_beats(100).len(), 4);
        assert!(engine.get_recent_beats(0).is_empty());
    }

    #[test]
    fn double_trigger_keeps_event_and_tempo() {
        let mut engine = SyncEngine::new(config()).unwrap();
        let mut events = Vec::new();
        for i in 0..=120 {
            // Second pulse 0.1 s after the first implies 600 BPM.
            let strength = if i == 50 || i == 60 { 0.6 } else { 0.0 };
            events.extend(engine.process_onset(strength, i as f64 * 0.01));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tempo_bpm, 120.0);
        assert!((events[1].position_in_measure - 0.2).abs() < 1e-3);
        assert_eq!(engine.get_metrics().false_positives, 1);
        // The tracker never saw the second beat.
        assert_eq!(engine.tempo_estimate().bpm, 120.0);
        assert_eq!(engine.tempo_estimate().confidence, 0.0);
    }

    #[test]
    fn off_grid_beat_position_in_measure() {
        let mut engine = SyncEngine::new(config()).unwrap();
        let pulses = [50, 100, 150, 200, 250, 320];
        let events: Vec<BeatEvent> = (0..=340)
            .filter_map(|i| {
                let strength = if pulses.contains(&i) { 0.6 } else { 0.0 };
                engine.process_onset(strength, i as f64 * 0.01)
            })
            .collect();
        assert_eq!(events.len(), 6);
        let last = events[5];
        // 0.7 s after the previous beat at 120 BPM: 0.2 s into a 0.5 s beat.
        assert!((last.tempo_bpm - 120.0).abs() < 0.5);
        assert!((last.position_in_measure - 0.4).abs() < 1e-3, "{last:?}");
    }

    #[test]
    fn narrowed_tempo_range_clamps_published_tempo() {
        let mut engine = SyncEngine::new(config()).unwrap();
        run_pulses(&mut engine, 520);
        assert!((engine.get_sync_state().current_tempo - 120.0).abs() < 1.0);

        engine
            .update_config(&SyncConfigUpdate {
                min_tempo: Some(140.0),
                max_tempo: Some(180.0),
                ..SyncConfigUpdate::default()
            })
            .unwrap();
        assert_eq!(engine.get_sync_state().current_tempo, 140.0);

        engine.process_onset(0.0, 5.21);
        let state = engine.get_sync_state();
        assert!((140.0..=180.0).contains(&state.current_tempo), "{state:?}");
        assert!((state.beat_interval() - 60.0 / 140.0).abs() < 1e-9);
        assert_eq!(engine.handle().snapshot(), state);
    }

    #[test]
    fn update_config_rejects_and_keeps_previous() {
        let mut engine = SyncEngine::new(config()).unwrap();
        let before = engine.config().clone();
        let bad = SyncConfigUpdate {
            adaptive_peak_window_size: Some(4),
            ..SyncConfigUpdate::default()
        };
        assert_eq!(engine.update_config(&bad), Err(ConfigError::EvenWindow(4)));
        assert_eq!(engine.config(), &before);
    }

    #[test]
    fn update_config_rebuilds_tracker_and_measure() {
        let mut engine = SyncEngine::new(config()).unwrap();
        run_pulses(&mut engine, 520);
        assert!(engine.tempo_estimate().confidence > 0.9);

        engine
            .update_config(&SyncConfigUpdate {
                min_tempo: Some(140.0),
                max_tempo: Some(180.0),
                beats_per_measure: Some(3),
                ..SyncConfigUpdate::default()
            })
            .unwrap();
        let estimate = engine.tempo_estimate();
        assert_eq!(estimate.bpm, 140.0);
        assert_eq!(estimate.confidence, 0.0);
        assert_eq!(engine.get_sync_state().beats_per_measure, 3);
        assert_eq!(engine.get_recent_beats(100).len(), 10);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut engine = SyncEngine::new(config()).unwrap();
        run_pulses(&mut engine, 300);
        engine.reset();
        let once = engine.get_sync_state();
        engine.reset();
        assert_eq!(engine.get_sync_state(), once);
        assert!(!once.has_beat);
        assert_eq!(once.confidence, 0.0);
        assert_eq!(once.current_tempo, 120.0);
        assert!(engine.get_recent_beats(10).is_empty());
        assert_eq!(engine.get_metrics(), SyncMetrics::default());

        // The pipeline works again from scratch.
        assert_eq!(run_pulses(&mut engine, 520).len(), 10);
    }

    #[test]
    fn disposed_engine_ignores_frames() {
        let mut engine = SyncEngine::new(config()).unwrap();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(run_pulses(&mut engine, 520).is_empty());
        assert_eq!(engine.get_metrics().frames_processed, 0);
        assert!(
            engine
                .set_scorer(Box::new(|_: &FeatureVector| -> anyhow::Result<BeatScore> {
                    anyhow::bail!("unused")
                }))
                .is_err()
        );
    }

    #[test]
    fn non_finite_input_is_neutral() {
        let mut engine = SyncEngine::new(config()).unwrap();
        for i in 0..20 {
            assert!(engine.process_onset(f32::NAN, i as f64 * 0.01).is_none());
        }
        assert!(engine.process_onset(f32::INFINITY, 0.2).is_none());
        let state = engine.get_sync_state();
        assert!(!state.has_beat);
        assert!(state.adaptive_threshold.is_finite());
    }

    #[test]
    fn scorer_adjusts_tempo_and_confidence() {
        let scorer = Box::new(|_: &FeatureVector| -> anyhow::Result<BeatScore> {
            Ok(BeatScore {
                beat_probability: 0.9,
                tempo_adjustment: 0.5,
            })
        });
        let mut engine = SyncEngine::with_scorer(
            SyncConfig {
                scorer_timeout_ms: 1000,
                ..config()
            },
            scorer,
        )
        .unwrap();
        assert_eq!(engine.scorer_name(), Some("scorer"));
        let events = run_pulses(&mut engine, 520);
        assert_eq!(events.len(), 10);
        assert!(events.iter().all(|e| (e.confidence - 0.9).abs() < 1e-6));
        // 120 BPM nudged by 5%.
        assert!((events[0].tempo_bpm - 126.0).abs() < 1e-3);
        assert_eq!(engine.get_metrics().scorer_skips, 0);
    }
}
