//! audio - Capture, playback and PCM handling for the duplex engine
//!
//! Device I/O goes through the traits in `device`; `AlsaBackend` is the
//! production implementation. Uses ALSA on dedicated threads for real-time
//! I/O, and a software render graph for scheduled, detunable playback.

mod alsa_backend;
mod alsa_device;
pub mod capture;
pub mod device;
pub mod frame;
pub mod level_meter;
pub mod pcm_codec;
pub mod pitch;
pub mod render_graph;
pub mod resampler;
pub mod scheduler;

pub use alsa_backend::{AlsaBackend, AudioConfig};
pub use capture::CapturePipeline;
pub use device::{DeviceProvider, InputDevice, OutputDevice, SourceHandle, SourceId};
pub use frame::{AudioFrame, EncodedFrame};
pub use level_meter::rms;
pub use resampler::resample;
pub use scheduler::{PlaybackScheduler, PlaybackSource};
