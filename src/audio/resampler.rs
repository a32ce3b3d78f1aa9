//! Linear-interpolation sample-rate conversion.
//!
//! The capture device may not grant the requested rate, so buffers arrive at
//! whatever rate was negotiated and are converted here before encoding.

use std::borrow::Cow;

/// Convert `input` from `from_rate` to `to_rate`.
///
/// Equal rates return the input borrowed, without copying. The output holds
/// `ceil(len / ratio)` samples where `ratio = from_rate / to_rate`.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Cow<'_, [f32]> {
    if from_rate == to_rate {
        return Cow::Borrowed(input);
    }
    if input.is_empty() || from_rate == 0 || to_rate == 0 {
        return Cow::Owned(Vec::new());
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (input.len() as f64 / ratio).ceil() as usize;
    let last = input.len() - 1;

    let output = (0..new_len)
        .map(|i| {
            let idx = i as f64 * ratio;
            let lo = (idx.floor() as usize).min(last);
            let hi = (idx.ceil() as usize).min(last);
            let frac = (idx - idx.floor()) as f32;
            input[lo] + (input[hi] - input[lo]) * frac
        })
        .collect();

    Cow::Owned(output)
}
