//! 16-bit PCM codec and transport text encoding.
//!
//! - Encode: f32 → clamp → i16 (asymmetric scale) → little-endian bytes → base64
//! - Decode: base64 → bytes → i16 / 32768 → planar f32 frame
//!
//! The encode scale (32768 for negatives, 32767 otherwise) and the decode
//! divisor (always 32768) differ on purpose and must stay that way.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::frame::{AudioFrame, EncodedFrame};
use crate::{Error, Result};

/// Mime tag for raw PCM at `sample_rate`, e.g. `audio/pcm;rate=16000`.
pub fn mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Parse the `rate=` parameter out of a PCM mime tag.
///
/// Returns `Ok(None)` for a PCM tag without a rate and an error for any
/// other media type.
pub fn parse_mime_rate(mime: &str) -> Result<Option<u32>> {
    let mut parts = mime.split(';').map(str::trim);
    let media = parts.next().unwrap_or_default();
    if !media.eq_ignore_ascii_case("audio/pcm") {
        return Err(Error::Payload(format!("unsupported media type: {}", mime)));
    }
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                let rate = value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| Error::Payload(format!("bad rate in mime type: {}", mime)))?;
                return Ok(Some(rate));
            }
        }
    }
    Ok(None)
}

/// Convert one sample to 16-bit PCM.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples to 16-bit little-endian PCM.
pub fn encode(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        data.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    EncodedFrame { data, sample_rate }
}

/// Wrap PCM bytes in the transport-safe text encoding.
pub fn to_base64(frame: &EncodedFrame) -> String {
    STANDARD.encode(&frame.data)
}

/// Invert the transport text encoding back to raw bytes.
pub fn from_base64(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Interpret little-endian 16-bit PCM as a playable frame.
///
/// Trailing bytes that do not form a whole sample on every channel are
/// dropped, so malformed lengths never fail.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> AudioFrame {
    let channels = channels.max(1);
    let ch = channels as usize;
    let frames = bytes.len() / 2 / ch;

    let mut samples = vec![0.0f32; frames * ch];
    for (i, pair) in bytes.chunks_exact(2).take(frames * ch).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        // interleaved index i → planar position
        let frame = i / ch;
        let channel = i % ch;
        samples[channel * frames + frame] = value as f32 / 32768.0;
    }

    AudioFrame {
        samples,
        sample_rate,
        channels,
    }
}
