//! Sample rate conversion with rubato.
//!
//! Decoded audio arrives at whatever rate the file was recorded at; the
//! engine wants one fixed rate. The whole clip is converted in a single
//! fixed-input pass, then the resampler is flushed so the tail is not lost.

use crate::error::DecodeError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Convert mono `samples` from `input_rate` to `output_rate`.
///
/// The output holds `round(len * output_rate / input_rate)` samples, aligned
/// with the input (the resampler's start-up delay is removed).
pub fn resample_mono(samples: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if input_rate == output_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if input_rate == 0 || output_rate == 0 {
        return Err(DecodeError::Resample(format!("{} Hz to {} Hz", input_rate, output_rate)));
    }

    let ratio = output_rate as f64 / input_rate as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, samples.len(), 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();

    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?
        .swap_remove(0);
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?
        .swap_remove(0);
    output.extend_from_slice(&tail);

    let start = delay.min(output.len());
    let end = (start + expected).min(output.len());

    debug!(
        input_rate,
        output_rate,
        input_frames = samples.len(),
        output_frames = end - start,
        "Resampled audio"
    );

    Ok(output[start..end].to_vec())
}
