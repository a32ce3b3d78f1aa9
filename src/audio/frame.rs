//! Audio buffer types passed between pipeline stages.

/// A buffer of f32 samples in [-1.0, 1.0].
///
/// Multi-channel data is stored planar: all samples of channel 0, then all
/// samples of channel 1, and so on. The engine itself only produces mono.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Samples belonging to one channel.
    pub fn channel(&self, index: usize) -> &[f32] {
        let frames = self.frames();
        let start = index * frames;
        if index >= self.channels as usize {
            return &[];
        }
        &self.samples[start..start + frames]
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// 16-bit signed little-endian PCM bytes ready for the transport.
///
/// Ownership moves into the session on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
}

impl EncodedFrame {
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}
