//! Offline sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! The whole signal is available up front, so the converter feeds fixed
//! `RESAMPLE_CHUNK` blocks, flushes the remainder as a partial block, then
//! drains the filter delay so the output is aligned with the input and has
//! exactly `round(len * to / from)` samples.
//!
//! When both rates match the input is returned unchanged and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use super::AudioSignal;
use crate::error::{AudiotagError, Result};

/// Input frame count per rubato call.
const RESAMPLE_CHUNK: usize = 1024;

/// Convert mono f32 audio from `from_rate` to `to_rate`.
///
/// # Errors
/// Returns `AudiotagError::InvalidAudio` for a zero rate and
/// `AudiotagError::Decode` if rubato fails.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(AudiotagError::InvalidAudio(format!(
            "cannot resample {from_rate} Hz -> {to_rate} Hz"
        )));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        RESAMPLE_CHUNK,
        1, // mono
    )
    .map_err(|e| AudiotagError::Decode(format!("resampler init: {e}")))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
    let mut out = Vec::with_capacity(expected + delay);

    let mut pos = 0usize;
    while samples.len() - pos >= RESAMPLE_CHUNK {
        let block = &samples[pos..pos + RESAMPLE_CHUNK];
        let (_, produced) = resampler
            .process_into_buffer(&[block], &mut output_buf, None)
            .map_err(|e| AudiotagError::Decode(format!("resampler process: {e}")))?;
        out.extend_from_slice(&output_buf[0][..produced]);
        pos += RESAMPLE_CHUNK;
    }

    if pos < samples.len() {
        let tail: [&[f32]; 1] = [&samples[pos..]];
        let (_, produced) = resampler
            .process_partial_into_buffer(Some(&tail[..]), &mut output_buf, None)
            .map_err(|e| AudiotagError::Decode(format!("resampler flush: {e}")))?;
        out.extend_from_slice(&output_buf[0][..produced]);
    }

    // Push silence through until the delayed tail has been emitted.
    while out.len() < expected + delay {
        let (_, produced) = resampler
            .process_partial_into_buffer(None::<&[&[f32]]>, &mut output_buf, None)
            .map_err(|e| AudiotagError::Decode(format!("resampler drain: {e}")))?;
        if produced == 0 {
            break;
        }
        out.extend_from_slice(&output_buf[0][..produced]);
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out)
}

impl AudioSignal {
    /// Return this signal converted to `target_rate` (no-op when already there).
    pub fn resampled(self, target_rate: u32) -> Result<AudioSignal> {
        if self.sample_rate == target_rate {
            return Ok(self);
        }
        let samples = resample(&self.samples, self.sample_rate, target_rate)?;
        Ok(AudioSignal::new(samples, target_rate))
    }
}
