//! Gapless playback scheduling on the output device timeline.
//!
//! Inbound buffers arrive at irregular intervals but must play back to back.
//! A single cursor records where the last scheduled buffer ends; each new
//! buffer starts there and pushes the cursor forward by its own duration.
//! If the device clock has already passed the cursor (underrun) the cursor
//! snaps to just ahead of the clock.
//!
//! The scheduler is owned by the controller task. Completions, pitch changes
//! and interruptions all arrive as messages on that task, so the active set is
//! never observed mid-mutation.

use std::collections::BTreeMap;
use std::time::Duration;

use super::device::{OutputDevice, SourceHandle, SourceId};
use super::frame::AudioFrame;
use crate::config::PlaybackConfig;
use crate::Result;

/// One scheduled buffer.
pub struct PlaybackSource {
    pub start_time: f64,
    pub duration: f64,
    handle: Box<dyn SourceHandle>,
}

pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    sources: BTreeMap<SourceId, PlaybackSource>,
    next_start_time: f64,
    next_id: SourceId,
    detune: f32,
    start_epsilon: f64,
    detune_ramp: Duration,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>, config: &PlaybackConfig, detune: f32) -> Self {
        Self {
            output,
            sources: BTreeMap::new(),
            next_start_time: 0.0,
            next_id: 1,
            detune,
            start_epsilon: config.start_epsilon.as_secs_f64(),
            detune_ramp: config.detune_ramp,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.sources.len()
    }

    pub fn detune(&self) -> f32 {
        self.detune
    }

    pub fn source(&self, id: SourceId) -> Option<&PlaybackSource> {
        self.sources.get(&id)
    }

    /// Queue a decoded buffer right after the previously queued one.
    pub fn schedule(&mut self, frame: AudioFrame) -> Result<SourceId> {
        let now = self.output.current_time();
        if self.next_start_time < now {
            log::debug!(
                "Playback underrun: cursor {:.3}s behind clock {:.3}s",
                now - self.next_start_time,
                now
            );
            self.next_start_time = now + self.start_epsilon;
        }

        let id = self.next_id;
        self.next_id += 1;

        let start_time = self.next_start_time;
        let duration = frame.duration();
        let handle = self
            .output
            .schedule_buffer(id, frame, start_time, self.detune)?;

        self.next_start_time += duration;
        self.sources.insert(
            id,
            PlaybackSource {
                start_time,
                duration,
                handle,
            },
        );
        log::trace!("Scheduled source {} at {:.3}s for {:.3}s", id, start_time, duration);
        Ok(id)
    }

    /// A source finished on its own. Unknown ids are ignored.
    pub fn on_source_ended(&mut self, id: SourceId) {
        self.sources.remove(&id);
    }

    /// Set the pitch for future sources and glide every playing one to it.
    pub fn set_pitch(&mut self, cents: f32) {
        self.detune = cents;
        for (id, source) in self.sources.iter_mut() {
            if let Err(e) = source.handle.ramp_detune(cents, self.detune_ramp) {
                log::trace!("Skipping pitch update for source {}: {}", id, e);
            }
        }
    }

    /// Barge-in: silence everything and restart the timeline at the clock.
    pub fn interrupt(&mut self) {
        let stopped = self.stop_all();
        self.next_start_time = self.output.current_time();
        log::info!("Playback interrupted, {} sources stopped", stopped);
    }

    /// Stop sources, close the device and zero the cursor.
    pub fn close(&mut self) {
        self.stop_all();
        self.output.close();
        self.next_start_time = 0.0;
    }

    fn stop_all(&mut self) -> usize {
        let sources = std::mem::take(&mut self.sources);
        let count = sources.len();
        for (_, mut source) in sources {
            source.handle.stop();
        }
        count
    }
}
