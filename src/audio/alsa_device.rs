//! ALSA PCM helpers shared by the capture and render threads.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// What the hardware actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a capture PCM, asking for `sample_rate` and accepting the nearest rate.
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None)
}

/// Open a playback PCM, asking for `sample_rate` and accepting the nearest rate.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, NegotiatedParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, NegotiatedParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels_near(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)
            .with_context(|| format!("Failed to apply {} hardware params", dir_name))?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        NegotiatedParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate {
        log::warn!(
            "ALSA {}: {}Hz not supported by '{}', using {}Hz",
            dir_name,
            sample_rate,
            device,
            params.sample_rate,
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
