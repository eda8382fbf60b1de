//! Optional learned beat scorer.
//!
//! The scorer itself is an external collaborator; this module defines the
//! interface, the fixed feature layout it receives, and the worker thread
//! that lets the engine bound how long it waits for an answer.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::beat::BeatCandidate;
use crate::beat::ring::RingBuffer;

use super::state::SyncState;

pub const FEATURE_LEN: usize = 50;
/// Magnitude spectrum of the current frame, averaged into this many bands.
pub const SPECTRAL_FEATURES: usize = 24;
/// Most recent onset-strength values (the time-domain view of the stream).
pub const ONSET_FEATURES: usize = 16;
/// tempo, beat phase, confidence, threshold, candidate strength.
pub const CONTEXT_FEATURES: usize = 5;
/// Most recent beat intervals, in seconds.
pub const INTERVAL_FEATURES: usize = 5;

const _: () = assert!(
    SPECTRAL_FEATURES + ONSET_FEATURES + CONTEXT_FEATURES + INTERVAL_FEATURES == FEATURE_LEN
);

pub type FeatureVector = [f32; FEATURE_LEN];

/// How long `shutdown` waits for an in-flight prediction before detaching
/// the scorer thread.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Scorer verdict for one beat candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatScore {
    /// Multiplies the candidate confidence. Clamped to [0, 1].
    pub beat_probability: f32,
    /// Tempo nudge; the provisional tempo is scaled by `1 + adjustment * 0.1`.
    /// Clamped to [-1, 1].
    pub tempo_adjustment: f32,
}

impl BeatScore {
    fn sanitized(self) -> Option<Self> {
        if !self.beat_probability.is_finite() {
            return None;
        }
        let tempo_adjustment = if self.tempo_adjustment.is_finite() {
            self.tempo_adjustment.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        Some(Self {
            beat_probability: self.beat_probability.clamp(0.0, 1.0),
            tempo_adjustment,
        })
    }

    /// Factor applied to the provisional tempo.
    pub fn tempo_factor(&self) -> f32 {
        1.0 + self.tempo_adjustment * 0.1
    }
}

/// Pluggable candidate scorer. Runs on its own thread, so it only needs to
/// be `Send`.
pub trait BeatScorer: Send {
    fn predict(&mut self, features: &FeatureVector) -> anyhow::Result<BeatScore>;

    fn name(&self) -> &str {
        "scorer"
    }
}

impl<F> BeatScorer for F
where
    F: FnMut(&FeatureVector) -> anyhow::Result<BeatScore> + Send,
{
    fn predict(&mut self, features: &FeatureVector) -> anyhow::Result<BeatScore> {
        self(features)
    }
}

/// Everything the feature vector is built from.
pub struct FeatureContext<'a> {
    pub spectrum: &'a [f32],
    pub onsets: &'a RingBuffer<f32>,
    pub state: &'a SyncState,
    pub candidate: &'a BeatCandidate,
    pub max_tempo: f32,
    /// Beat timestamps, oldest first.
    pub beat_times: &'a [f64],
}

/// Lay out the fixed-size feature vector:
/// `[spectral bands | recent onsets | context | recent intervals]`.
/// Missing history is zero-filled.
pub fn build_features(ctx: &FeatureContext<'_>) -> FeatureVector {
    let mut out = [0.0f32; FEATURE_LEN];
    let (spectral, rest) = out.split_at_mut(SPECTRAL_FEATURES);
    let (onsets, rest) = rest.split_at_mut(ONSET_FEATURES);
    let (context, intervals) = rest.split_at_mut(CONTEXT_FEATURES);

    if !ctx.spectrum.is_empty() {
        let band = ctx.spectrum.len().div_ceil(SPECTRAL_FEATURES);
        for (slot, chunk) in spectral.iter_mut().zip(ctx.spectrum.chunks(band)) {
            *slot = chunk.iter().sum::<f32>() / chunk.len() as f32;
        }
    }

    // Newest onsets at the end, zero padding at the front.
    let take = ctx.onsets.len().min(ONSET_FEATURES);
    let skip = ctx.onsets.len() - take;
    let offset = ONSET_FEATURES - take;
    for (i, v) in ctx.onsets.iter().skip(skip).enumerate() {
        onsets[offset + i] = v;
    }

    context[0] = ctx.state.current_tempo / ctx.max_tempo.max(1.0);
    context[1] = ctx.state.beat_phase;
    context[2] = ctx.state.confidence;
    context[3] = ctx.state.adaptive_threshold;
    context[4] = ctx.candidate.strength;

    let times = ctx.beat_times;
    let diffs = times.windows(2).map(|w| (w[1] - w[0]) as f32);
    let n = times.len().saturating_sub(1);
    let diffs = diffs.skip(n.saturating_sub(INTERVAL_FEATURES));
    let offset = INTERVAL_FEATURES - n.min(INTERVAL_FEATURES);
    for (i, d) in diffs.enumerate() {
        intervals[offset + i] = d;
    }

    for v in &mut out {
        if !v.is_finite() {
            *v = 0.0;
        }
    }
    out
}

/// Why a scorer verdict is unavailable for the current candidate.
#[derive(Debug, Error)]
pub enum ScoreSkip {
    #[error("scorer still busy with an abandoned request")]
    Busy,
    #[error("scorer did not answer within {0:?}")]
    Timeout(Duration),
    #[error("scorer failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("scorer returned a non-finite probability")]
    Invalid,
    #[error("scorer thread is gone")]
    Disconnected,
}

struct ScoreRequest {
    id: u64,
    features: FeatureVector,
}

struct ScoreResponse {
    id: u64,
    result: anyhow::Result<BeatScore>,
}

/// Owns the scorer on a dedicated thread. Each request carries an id so an
/// answer that arrives after its deadline is discarded instead of being
/// applied to a later candidate.
pub(crate) struct ScorerWorker {
    requests: Option<Sender<ScoreRequest>>,
    responses: Receiver<ScoreResponse>,
    handle: Option<JoinHandle<()>>,
    /// Disconnects when the scorer thread exits, panics included.
    exited: Receiver<()>,
    next_id: u64,
    name: String,
    alive: bool,
}

impl ScorerWorker {
    pub fn spawn(mut scorer: Box<dyn BeatScorer>) -> anyhow::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::bounded::<ScoreRequest>(1);
        let (resp_tx, resp_rx) = crossbeam_channel::bounded::<ScoreResponse>(2);
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(0);
        let name = scorer.name().to_string();

        let handle = thread::Builder::new()
            .name("beatsync-scorer".into())
            .spawn(move || {
                let _exit = exit_tx;
                for req in req_rx {
                    let result = scorer.predict(&req.features);
                    if resp_tx.send(ScoreResponse { id: req.id, result }).is_err() {
                        break;
                    }
                }
                log::debug!("Scorer thread shutting down");
            })?;

        log::info!("Beat scorer '{name}' started");
        Ok(Self {
            requests: Some(req_tx),
            responses: resp_rx,
            handle: Some(handle),
            exited: exit_rx,
            next_id: 0,
            name,
            alive: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for a verdict and wait at most `timeout` for it.
    pub fn score(&mut self, features: FeatureVector, timeout: Duration) -> Result<BeatScore, ScoreSkip> {
        let Some(requests) = self.requests.as_ref().filter(|_| self.alive) else {
            return Err(ScoreSkip::Disconnected);
        };

        // Answers to abandoned requests.
        while self.responses.try_recv().is_ok() {}

        self.next_id += 1;
        let id = self.next_id;
        match requests.try_send(ScoreRequest { id, features }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(ScoreSkip::Busy),
            Err(TrySendError::Disconnected(_)) => {
                self.mark_dead();
                return Err(ScoreSkip::Disconnected);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.responses.recv_deadline(deadline) {
                Ok(resp) if resp.id == id => {
                    return match resp.result {
                        Ok(score) => score.sanitized().ok_or(ScoreSkip::Invalid),
                        Err(e) => Err(ScoreSkip::Failed(e)),
                    };
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(ScoreSkip::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    self.mark_dead();
                    return Err(ScoreSkip::Disconnected);
                }
            }
        }
    }

    fn mark_dead(&mut self) {
        if self.alive {
            log::error!("Beat scorer '{}' thread exited; continuing without it", self.name);
            self.alive = false;
        }
    }

    /// Stop the thread and drop the scorer. Waits at most `SHUTDOWN_GRACE`
    /// for an in-flight prediction; a scorer still stuck after that is left
    /// to finish on its detached thread and never receives another request.
    pub fn shutdown(&mut self) {
        self.requests.take();
        self.alive = false;
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(SHUTDOWN_GRACE) {
            log::warn!(
                "Beat scorer '{}' still busy after {SHUTDOWN_GRACE:?}; detaching its thread",
                self.name
            );
            return;
        }
        if handle.join().is_err() {
            log::error!("Beat scorer '{}' thread panicked", self.name);
        } else {
            log::info!("Beat scorer '{}' stopped", self.name);
        }
    }
}

impl Drop for ScorerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn fixed(p: f32, adj: f32) -> Box<dyn BeatScorer> {
        Box::new(move |_: &FeatureVector| -> anyhow::Result<BeatScore> {
            Ok(BeatScore {
                beat_probability: p,
                tempo_adjustment: adj,
            })
        })
    }

    #[test]
    fn worker_returns_sanitized_score() {
        let mut w = ScorerWorker::spawn(fixed(1.4, -3.0)).unwrap();
        let score = w.score([0.0; FEATURE_LEN], TIMEOUT).unwrap();
        assert_eq!(score.beat_probability, 1.0);
        assert_eq!(score.tempo_adjustment, -1.0);
        assert!((score.tempo_factor() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn worker_reports_errors() {
        let failing: Box<dyn BeatScorer> =
            Box::new(|_: &FeatureVector| -> anyhow::Result<BeatScore> { Err(anyhow!("model not loaded")) });
        let mut w = ScorerWorker::spawn(failing).unwrap();
        let err = w.score([0.0; FEATURE_LEN], TIMEOUT).unwrap_err();
        assert!(matches!(err, ScoreSkip::Failed(_)));
        // Still usable afterwards.
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], TIMEOUT),
            Err(ScoreSkip::Failed(_))
        ));
    }

    #[test]
    fn nan_probability_is_invalid() {
        let mut w = ScorerWorker::spawn(fixed(f32::NAN, 0.0)).unwrap();
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], TIMEOUT),
            Err(ScoreSkip::Invalid)
        ));
    }

    #[test]
    fn slow_answer_is_discarded() {
        let mut calls = 0u32;
        let slow: Box<dyn BeatScorer> = Box::new(move |_: &FeatureVector| -> anyhow::Result<BeatScore> {
            calls += 1;
            if calls == 1 {
                thread::sleep(Duration::from_millis(150));
            }
            Ok(BeatScore {
                beat_probability: calls as f32 / 10.0,
                tempo_adjustment: 0.0,
            })
        });
        let mut w = ScorerWorker::spawn(slow).unwrap();
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], Duration::from_millis(5)),
            Err(ScoreSkip::Timeout(_))
        ));
        // The late answer to call 1 must not be returned for call 2.
        let score = w.score([0.0; FEATURE_LEN], TIMEOUT).unwrap();
        assert!((score.beat_probability - 0.2).abs() < 1e-6);
    }

    #[test]
    fn panicking_scorer_disconnects() {
        let boom: Box<dyn BeatScorer> =
            Box::new(|_: &FeatureVector| -> anyhow::Result<BeatScore> { panic!("scorer bug") });
        let mut w = ScorerWorker::spawn(boom).unwrap();
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], TIMEOUT),
            Err(ScoreSkip::Disconnected)
        ));
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], TIMEOUT),
            Err(ScoreSkip::Disconnected)
        ));
        w.shutdown();
    }

    #[test]
    fn shutdown_does_not_wait_for_hung_scorer() {
        let hung: Box<dyn BeatScorer> = Box::new(|_: &FeatureVector| -> anyhow::Result<BeatScore> {
            thread::sleep(Duration::from_secs(30));
            anyhow::bail!("woke up")
        });
        let mut w = ScorerWorker::spawn(hung).unwrap();
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], Duration::from_millis(5)),
            Err(ScoreSkip::Timeout(_))
        ));
        let start = Instant::now();
        w.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            w.score([0.0; FEATURE_LEN], TIMEOUT),
            Err(ScoreSkip::Disconnected)
        ));
    }

    #[test]
    fn shutdown_joins_idle_scorer_promptly() {
        let mut w = ScorerWorker::spawn(fixed(0.5, 0.0)).unwrap();
        w.score([0.0; FEATURE_LEN], TIMEOUT).unwrap();
        let start = Instant::now();
        w.shutdown();
        assert!(start.elapsed() < SHUTDOWN_GRACE);
        w.shutdown();
    }

    #[test]
    fn features_have_fixed_layout() {
        let mut onsets = RingBuffer::new(32);
        for i in 0..3 {
            onsets.push(i as f32);
        }
        let state = SyncState::initial(120.0, 0.3, 4);
        let candidate = BeatCandidate {
            timestamp: 1.0,
            strength: 0.6,
            confidence: 1.0,
        };
        let spectrum = vec![2.0f32; 48];
        let beat_times = [0.0, 0.5, 1.0];
        let f = build_features(&FeatureContext {
            spectrum: &spectrum,
            onsets: &onsets,
            state: &state,
            candidate: &candidate,
            max_tempo: 200.0,
            beat_times: &beat_times,
        });

        assert!(f[..SPECTRAL_FEATURES].iter().all(|&v| v == 2.0));
        let o = SPECTRAL_FEATURES;
        assert_eq!(&f[o + ONSET_FEATURES - 3..o + ONSET_FEATURES], &[0.0, 1.0, 2.0]);
        let c = o + ONSET_FEATURES;
        assert!((f[c] - 0.6).abs() < 1e-6);
        assert_eq!(f[c + 3], 0.3);
        assert_eq!(f[c + 4], 0.6);
        let i = c + CONTEXT_FEATURES;
        assert_eq!(&f[i..], &[0.0, 0.0, 0.0, 0.5, 0.5]);
    }

    #[test]
    fn features_from_empty_context_are_zero_padded() {
        let onsets = RingBuffer::new(4);
        let state = SyncState::initial(120.0, 0.3, 4);
        let candidate = BeatCandidate {
            timestamp: 0.0,
            strength: 0.5,
            confidence: 1.0,
        };
        let f = build_features(&FeatureContext {
            spectrum: &[],
            onsets: &onsets,
            state: &state,
            candidate: &candidate,
            max_tempo: 200.0,
            beat_times: &[],
        });
        assert!(f[..SPECTRAL_FEATURES + ONSET_FEATURES].iter().all(|&v| v == 0.0));
        assert!(f[FEATURE_LEN - INTERVAL_FEATURES..].iter().all(|&v| v == 0.0));
    }
}
