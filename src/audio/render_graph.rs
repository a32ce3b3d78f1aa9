//! Software playback graph behind an output device.
//!
//! Holds every scheduled voice on a frame-accurate timeline and mixes them
//! one period at a time. The frame counter is the device clock.
//!
//! Pitch is applied once, to the mixed timeline, by a single shifter that
//! runs for the lifetime of the graph. Each voice still carries its own
//! detune; the voice sounding at a frame decides the detune for that frame.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::device::{SourceHandle, SourceId};
use super::frame::AudioFrame;
use super::pitch::PitchShifter;
use super::resampler::resample;
use crate::{Error, Result};

/// A detune value with an optional linear ramp in progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetuneParam {
    value: f32,
    target: f32,
    step: f32,
    remaining: u64,
}

impl DetuneParam {
    pub fn new(cents: f32) -> Self {
        Self {
            value: cents,
            target: cents,
            step: 0.0,
            remaining: 0,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    /// Reach `cents` after `frames` calls to `advance`.
    pub fn ramp_to(&mut self, cents: f32, frames: u64) {
        self.target = cents;
        if frames == 0 {
            self.value = cents;
            self.step = 0.0;
            self.remaining = 0;
        } else {
            self.step = (cents - self.value) / frames as f32;
            self.remaining = frames;
        }
    }

    /// Current value, then move one frame along the ramp.
    pub fn advance(&mut self) -> f32 {
        let current = self.value;
        if self.remaining > 0 {
            self.remaining -= 1;
            self.value = if self.remaining == 0 {
                self.target
            } else {
                self.value + self.step
            };
        }
        current
    }
}

struct Voice {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
    detune: DetuneParam,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

pub struct RenderGraph {
    sample_rate: u32,
    frame: u64,
    voices: Vec<Voice>,
    shifter: PitchShifter,
    /// Detune of the last sounding frame, held across silence
    cents: f32,
}

impl RenderGraph {
    pub fn new(sample_rate: u32, pitch_window: Duration) -> Self {
        let window_frames = (pitch_window.as_secs_f64() * sample_rate as f64).round() as usize;
        Self {
            sample_rate,
            frame: 0,
            voices: Vec::new(),
            shifter: PitchShifter::new(window_frames),
            cents: 0.0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device time in seconds.
    pub fn current_time(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Add a voice starting at `start_time` seconds. Start times in the past
    /// begin at the current frame.
    pub fn add_voice(&mut self, id: SourceId, frame: AudioFrame, start_time: f64, detune: f32) {
        // Only the first channel is played; the engine produces mono.
        let mono = frame.channel(0);
        let samples = resample(mono, frame.sample_rate, self.sample_rate).into_owned();
        let start_frame = ((start_time.max(0.0) * self.sample_rate as f64).round() as u64).max(self.frame);

        self.voices.push(Voice {
            id,
            samples,
            start_frame,
            detune: DetuneParam::new(detune),
        });
    }

    /// Stop a voice. Once nothing is left, the shifter's pending tail is
    /// discarded too.
    pub fn remove_voice(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        if self.voices.is_empty() {
            self.shifter.reset();
        }
        self.voices.len() != before
    }

    /// Ramp a voice's detune. Returns false if the voice is gone.
    pub fn ramp_detune(&mut self, id: SourceId, cents: f32, ramp: Duration) -> bool {
        let frames = (ramp.as_secs_f64() * self.sample_rate as f64).round() as u64;
        match self.voices.iter_mut().find(|v| v.id == id) {
            Some(voice) => {
                voice.detune.ramp_to(cents, frames);
                true
            }
            None => false,
        }
    }

    pub fn detune_of(&self, id: SourceId) -> Option<DetuneParam> {
        self.voices.iter().find(|v| v.id == id).map(|v| v.detune)
    }

    pub fn clear(&mut self) {
        self.voices.clear();
        self.shifter.reset();
    }

    /// Mix the next `out.len()` mono frames and advance the clock.
    ///
    /// Returns the ids of voices that finished inside this period.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<SourceId> {
        out.fill(0.0);
        let period_start = self.frame;
        let period_end = period_start + out.len() as u64;

        for (i, slot) in out.iter_mut().enumerate() {
            let t = period_start + i as u64;
            let mut dry = 0.0f32;
            let mut sounding = None;
            for voice in &mut self.voices {
                let cents = voice.detune.advance();
                if t < voice.start_frame || t >= voice.end_frame() {
                    continue;
                }
                dry += voice.samples[(t - voice.start_frame) as usize];
                sounding = Some(cents);
            }
            if let Some(cents) = sounding {
                self.cents = cents;
            }
            *slot = self.shifter.process(dry, self.cents).clamp(-1.0, 1.0);
        }

        self.frame = period_end;

        let mut ended = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame() <= period_end {
                ended.push(v.id);
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Handle to one voice of a shared graph.
pub struct GraphSourceHandle {
    id: SourceId,
    graph: Arc<Mutex<RenderGraph>>,
}

impl GraphSourceHandle {
    pub fn new(id: SourceId, graph: Arc<Mutex<RenderGraph>>) -> Self {
        Self { id, graph }
    }
}

impl SourceHandle for GraphSourceHandle {
    fn stop(&mut self) {
        if let Ok(mut graph) = self.graph.lock() {
            graph.remove_voice(self.id);
        }
    }

    fn ramp_detune(&mut self, cents: f32, ramp: Duration) -> Result<()> {
        let mut graph = self
            .graph
            .lock()
            .map_err(|_| Error::Device("render graph lock poisoned".to_string()))?;
        if graph.ramp_detune(self.id, cents, ramp) {
            Ok(())
        } else {
            Err(Error::Device(format!("source {} has already stopped", self.id)))
        }
    }
}
