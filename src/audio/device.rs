//! Device boundary consumed by the pipeline.
//!
//! A `DeviceProvider` opens input and output devices at a requested rate and
//! reports back whatever rate the hardware actually granted. Rate fallback is
//! therefore a capability query, never an error.

use std::time::Duration;

use tokio::sync::mpsc;

use super::frame::AudioFrame;
use crate::Result;

/// Identifier of one scheduled playback source.
pub type SourceId = u64;

/// Microphone side of the device layer.
pub trait InputDevice: Send {
    /// Rate the device was opened at after negotiation.
    fn sample_rate(&self) -> u32;

    /// Begin delivering mono buffers at `sample_rate()` on `frames`.
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()>;

    /// Stop delivering buffers and release the microphone. Idempotent.
    fn stop(&mut self);
}

/// Speaker side of the device layer: a clocked playback timeline.
pub trait OutputDevice: Send {
    /// Rate the device was opened at after negotiation.
    fn sample_rate(&self) -> u32;

    /// Monotonic device time in seconds.
    fn current_time(&self) -> f64;

    /// Start the device clock.
    fn resume(&mut self) -> Result<()>;

    /// Schedule `frame` to begin at `start_time` with an initial detune in cents.
    ///
    /// When playback finishes naturally the device reports `id` on the
    /// completion channel it was opened with.
    fn schedule_buffer(
        &mut self,
        id: SourceId,
        frame: AudioFrame,
        start_time: f64,
        detune: f32,
    ) -> Result<Box<dyn SourceHandle>>;

    /// Stop the clock and release the device. Idempotent.
    fn close(&mut self);
}

/// Live control over one scheduled source.
pub trait SourceHandle: Send {
    /// Stop and discard the source. No completion is reported afterwards.
    fn stop(&mut self);

    /// Move the detune to `cents` over `ramp`.
    ///
    /// Fails if the source has already finished playing.
    fn ramp_detune(&mut self, cents: f32, ramp: Duration) -> Result<()>;
}

/// Opens devices for one session.
pub trait DeviceProvider: Send {
    fn open_input(&mut self, requested_rate: u32) -> Result<Box<dyn InputDevice>>;

    fn open_output(
        &mut self,
        requested_rate: u32,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputDevice>>;
}
