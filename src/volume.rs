//! Volume reporting.
//!
//! The engine reports raw levels: `(input, 0)` for every capture buffer and
//! `(0, output)` for every decoded inbound buffer. Smoothing is the
//! observer's business; `VolumeState` is the decay policy the console
//! front-end uses.

use std::sync::Arc;

/// Called with `(input_level, output_level)`; exactly one is meaningful.
pub type VolumeObserver = Arc<dyn Fn(f32, f32) + Send + Sync>;

/// Per-update decay applied to a channel that reported no fresh level.
pub const DEFAULT_DECAY: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    pub input: f32,
    pub output: f32,
    decay: f32,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY)
    }
}

impl VolumeState {
    pub fn new(decay: f32) -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            decay: decay.clamp(0.0, 1.0),
        }
    }

    /// Fold one report in. A zero channel decays toward 0 instead of
    /// dropping to it.
    pub fn observe(&mut self, input: f32, output: f32) {
        self.input = self.fold(self.input, input);
        self.output = self.fold(self.output, output);
    }

    fn fold(&self, previous: f32, fresh: f32) -> f32 {
        if fresh > 0.0 {
            fresh.min(1.0)
        } else {
            previous * self.decay
        }
    }
}
