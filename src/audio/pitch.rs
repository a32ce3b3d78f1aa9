//! Duration-preserving pitch shift.
//!
//! Two read heads sweep a delay line that lags the playback position. Each
//! head reads the signal at `2^(cents/1200)` times normal speed while its
//! delay wraps inside a short window, and the heads sit half a window apart
//! under complementary sin² envelopes so every wrap happens at zero gain.
//! One sample goes in for every sample out.
//!
//! The delay line is fed continuously, so consecutive buffers played through
//! the same shifter join without a fade.

use std::f64::consts::PI;

/// Detune below this magnitude plays the signal untouched.
const BYPASS_CENTS: f32 = 0.01;

pub fn cents_to_ratio(cents: f32) -> f64 {
    2f64.powf(cents as f64 / 1200.0)
}

pub struct PitchShifter {
    window: f64,
    phase: f64,
    line: Vec<f32>,
    written: u64,
}

impl PitchShifter {
    /// `window_frames` is the grain length in frames.
    pub fn new(window_frames: usize) -> Self {
        let window = window_frames.max(2);
        Self {
            window: window as f64,
            phase: 0.0,
            // One window of history plus the interpolation neighbour
            line: vec![0.0; window + 2],
            written: 0,
        }
    }

    /// Push the next dry sample and return the shifted one.
    pub fn process(&mut self, dry: f32, cents: f32) -> f32 {
        let n = self.written;
        let slot = self.slot(n);
        self.line[slot] = dry;
        self.written += 1;

        if cents.abs() < BYPASS_CENTS {
            self.phase = 0.0;
            return dry;
        }

        let ratio = cents_to_ratio(cents);
        let mut out = 0.0f64;
        for offset in [0.0, 0.5] {
            let p = (self.phase + offset).fract();
            let weight = (PI * p).sin().powi(2);
            out += weight * self.read(n as f64 - p * self.window);
        }

        // d(read position)/dn = 1 - window * d(phase)/dn = ratio
        self.phase = (self.phase - (ratio - 1.0) / self.window).rem_euclid(1.0);
        out as f32
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.line.fill(0.0);
        self.phase = 0.0;
        self.written = 0;
    }

    fn slot(&self, frame: u64) -> usize {
        (frame % self.line.len() as u64) as usize
    }

    /// Linear read at an absolute frame position. Positions before the
    /// first sample or older than the line are silent.
    fn read(&self, pos: f64) -> f64 {
        if pos < 0.0 || self.written == 0 {
            return 0.0;
        }
        let newest = self.written - 1;
        let oldest = self.written.saturating_sub(self.line.len() as u64);
        let lo = (pos.floor() as u64).min(newest);
        if lo < oldest {
            return 0.0;
        }
        let hi = (lo + 1).min(newest);
        let frac = pos - pos.floor();
        let a = self.line[self.slot(lo)] as f64;
        let b = self.line[self.slot(hi)] as f64;
        a + (b - a) * frac
    }
}
