use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::beat::AnalysisFrame;

/// Reference spectral frontend: Hann-windowed FFT over a sliding window,
/// one [`AnalysisFrame`] per hop.
pub struct FrameAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    time_domain: Vec<f32>,
    fft_buffer: Vec<Complex<f32>>,
    /// Samples received but not yet a full hop.
    pending: Vec<f32>,
    fft_size: usize,
    hop_size: usize,
    num_bins: usize,
    sample_rate: u32,
    frames_emitted: u64,
}

impl FrameAnalyzer {
    pub fn new(sample_rate: u32, fft_size: usize, hop_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let hop_size = hop_size.clamp(1, fft_size);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let num_bins = fft_size / 2 + 1;

        let denom = (fft_size - 1) as f32;
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / denom).cos()))
            .collect();

        log::info!(
            "Frame analyzer: {fft_size}-point FFT, hop {hop_size}, {:.1} Hz/bin",
            sample_rate as f32 / fft_size as f32
        );

        Self {
            fft,
            window,
            time_domain: vec![0.0; fft_size],
            fft_buffer: vec![Complex::new(0.0, 0.0); fft_size],
            pending: Vec::with_capacity(hop_size * 2),
            fft_size,
            hop_size,
            num_bins,
            sample_rate,
            frames_emitted: 0,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Feed mono samples; returns every frame completed by them, in order.
    /// Frame `k` is timestamped `k * hop_size / sample_rate`.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AnalysisFrame> {
        self.pending.extend_from_slice(samples);
        let hops = self.pending.len() / self.hop_size;
        let mut frames = Vec::with_capacity(hops);

        for h in 0..hops {
            let chunk = h * self.hop_size..(h + 1) * self.hop_size;
            self.time_domain.copy_within(self.hop_size.., 0);
            let tail = self.fft_size - self.hop_size;
            self.time_domain[tail..].copy_from_slice(&self.pending[chunk]);
            frames.push(self.analyze());
        }
        self.pending.drain(..hops * self.hop_size);
        frames
    }

    fn analyze(&mut self) -> AnalysisFrame {
        for ((dst, &sample), &w) in self
            .fft_buffer
            .iter_mut()
            .zip(&self.time_domain)
            .zip(&self.window)
        {
            *dst = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.fft_buffer);

        let scale = 2.0 / self.fft_size as f32;
        let bins = &self.fft_buffer[..self.num_bins];
        let magnitudes = bins.iter().map(|c| c.norm() * scale).collect();
        let phase = bins.iter().map(|c| c.im.atan2(c.re)).collect();

        let timestamp =
            self.frames_emitted as f64 * self.hop_size as f64 / f64::from(self.sample_rate.max(1));
        self.frames_emitted += 1;
        AnalysisFrame::new(magnitudes, Some(phase), timestamp)
    }

    pub fn reset(&mut self) {
        self.time_domain.fill(0.0);
        self.pending.clear();
        self.frames_emitted = 0;
    }
}
