use std::f32::consts::PI;

use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use super::AnalysisFrame;

/// Bins quieter than this are ignored by the phase deviation function; their
/// phase is mostly noise.
const PHASE_MAGNITUDE_FLOOR: f32 = 0.01;

/// Onset detection function used by [`OnsetDetector::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnsetFunction {
    /// Positive magnitude change. Robust on percussive material.
    #[default]
    SpectralFlux,
    /// Magnitude-weighted phase prediction error. Better on tonal onsets.
    PhaseDeviation,
    /// Distance between predicted and observed complex bins.
    ComplexDomain,
}

impl OnsetFunction {
    pub fn uses_phase(self) -> bool {
        !matches!(self, Self::SpectralFlux)
    }
}

/// Previous-frame state for the phase deviation function.
#[derive(Default)]
struct PhaseHistory {
    prev: Vec<f32>,
    prev_prev: Vec<f32>,
    frames: u8,
}

/// Previous-frame state for the complex domain function.
#[derive(Default)]
struct ComplexHistory {
    mags: Vec<f32>,
    phase: Vec<f32>,
    primed: bool,
}

/// Turns one analysis frame into one onset-strength value.
///
/// Every function compares against its own copy of the previous frame and
/// returns 0 on its first call, so frame #1 never needs special handling.
pub struct OnsetDetector {
    function: OnsetFunction,
    flux_prev: Vec<f32>,
    flux_primed: bool,
    phase: PhaseHistory,
    complex: ComplexHistory,
}

impl OnsetDetector {
    pub fn new(function: OnsetFunction) -> Self {
        Self {
            function,
            flux_prev: Vec::new(),
            flux_primed: false,
            phase: PhaseHistory::default(),
            complex: ComplexHistory::default(),
        }
    }

    pub fn function(&self) -> OnsetFunction {
        self.function
    }

    /// Compute the onset strength of `frame` with the configured function.
    /// Phase-aware functions fall back to spectral flux when the frame has no
    /// phase spectrum.
    pub fn process(&mut self, frame: &AnalysisFrame) -> f32 {
        let value = match (self.function, frame.phase.as_deref()) {
            (OnsetFunction::PhaseDeviation, Some(phase)) => {
                self.phase_deviation(&frame.magnitudes, phase)
            }
            (OnsetFunction::ComplexDomain, Some(phase)) => {
                self.complex_domain(&frame.magnitudes, phase)
            }
            _ => self.spectral_flux(&frame.magnitudes),
        };
        if value.is_finite() { value.max(0.0) } else { 0.0 }
    }

    /// Sum of half-wave rectified magnitude differences against the previous
    /// call.
    pub fn spectral_flux(&mut self, magnitudes: &[f32]) -> f32 {
        let flux = if self.flux_primed {
            magnitudes
                .iter()
                .zip(self.flux_prev.iter())
                .map(|(&c, &p)| (c - p).max(0.0))
                .sum()
        } else {
            0.0
        };

        self.flux_prev.clear();
        self.flux_prev.extend_from_slice(magnitudes);
        self.flux_primed = true;
        flux
    }

    /// Magnitude-weighted deviation of each bin's phase from the value
    /// predicted by linear extrapolation of the previous two frames.
    pub fn phase_deviation(&mut self, magnitudes: &[f32], phase: &[f32]) -> f32 {
        let h = &mut self.phase;
        let mut deviation = 0.0f32;

        if h.frames > 0 {
            let n = magnitudes.len().min(phase.len()).min(h.prev.len());
            // With a single previous frame the prediction degrades to "phase
            // unchanged".
            let have_two = h.frames > 1 && h.prev_prev.len() >= n;
            for i in 0..n {
                let mag = magnitudes[i];
                if mag <= PHASE_MAGNITUDE_FLOOR {
                    continue;
                }
                let expected = if have_two {
                    2.0 * h.prev[i] - h.prev_prev[i]
                } else {
                    h.prev[i]
                };
                deviation += mag * wrap_phase(phase[i] - expected).abs();
            }
        }

        std::mem::swap(&mut h.prev, &mut h.prev_prev);
        h.prev.clear();
        h.prev.extend_from_slice(phase);
        h.frames = h.frames.saturating_add(1).min(2);
        deviation
    }

    /// Euclidean distance between the previous and current complex spectra.
    /// Mismatched lengths are compared over the shorter one.
    pub fn complex_domain(&mut self, magnitudes: &[f32], phase: &[f32]) -> f32 {
        let c = &mut self.complex;
        let mut distance = 0.0f32;

        if c.primed {
            let n = magnitudes
                .len()
                .min(phase.len())
                .min(c.mags.len())
                .min(c.phase.len());
            for i in 0..n {
                let prev = Complex::from_polar(c.mags[i], c.phase[i]);
                let cur = Complex::from_polar(magnitudes[i], phase[i]);
                distance += (cur - prev).norm();
            }
        }

        c.mags.clear();
        c.mags.extend_from_slice(magnitudes);
        c.phase.clear();
        c.phase.extend_from_slice(phase);
        c.primed = true;
        distance
    }

    /// Forget all previous-frame state (stream discontinuity).
    pub fn reset(&mut self) {
        self.flux_prev.clear();
        self.flux_primed = false;
        self.phase.prev.clear();
        self.phase.prev_prev.clear();
        self.phase.frames = 0;
        self.complex.mags.clear();
        self.complex.phase.clear();
        self.complex.primed = false;
    }
}

/// Wrap an angle into [-π, π].
pub fn wrap_phase(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    wrapped.clamp(-PI, PI)
}
