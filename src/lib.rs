//! voxduplex - real-time full-duplex voice streaming
//!
//! Microphone audio is metered, resampled and sent to a realtime speech
//! service as 16-bit PCM; the service's audio replies are decoded and
//! scheduled gaplessly on the speaker, with live pitch control and
//! barge-in interruption.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod state_machine;
pub mod volume;

pub use error::{Error, Result};
