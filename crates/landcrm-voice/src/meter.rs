//! Frequency-domain volume meter
//!
//! Mirrors the behaviour of a browser analyser node: Blackman-windowed FFT over
//! the most recent `fft_size` samples, magnitude smoothing over time, decibel
//! mapping onto a byte scale and an average across all bins. The result is
//! reported on a 0–100 scale where digital silence is exactly 0.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

/// Lower end of the decibel range mapped onto the byte scale
pub const MIN_DECIBELS: f32 = -100.0;
/// Upper end of the decibel range mapped onto the byte scale
pub const MAX_DECIBELS: f32 = -30.0;

pub struct SpectrumMeter {
    fft_size: usize,
    smoothing: f32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl SpectrumMeter {
    /// `fft_size` should be a power of two; `smoothing` is clamped into 0..=1.
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            fft,
            window: blackman(fft_size),
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// Feed mono samples; only the newest `fft_size` are kept
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &sample in &samples[skip..] {
            self.history.pop_front();
            self.history.push_back(sample);
        }
    }

    /// Drop all history and smoothing state
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }

    /// Current volume on the 0–100 scale. Advances the smoothing state.
    pub fn volume(&mut self) -> f32 {
        let n = self.fft_size;
        for (i, (slot, sample)) in self.buffer.iter_mut().zip(self.history.iter()).enumerate() {
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let tau = self.smoothing;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut total = 0.0f32;
        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.buffer[k].norm() / n as f32;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            total += byte_level(*smoothed, range);
        }

        let average = total / self.smoothed.len() as f32;
        average * 100.0 / 255.0
    }
}

fn byte_level(magnitude: f32, range: f32) -> f32 {
    if magnitude <= 0.0 || !magnitude.is_finite() {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0).floor()
}

fn blackman(n: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42f32, 0.5f32, 0.08f32);
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}
