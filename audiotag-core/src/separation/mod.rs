//! Source separation ahead of instrument tagging.
//!
//! A separator is an opaque audio-to-audio transform: it receives the decoded
//! (possibly multi-channel) input and returns one mono stem at the input's
//! sample rate. The ONNX implementation lives in
//! [`inference::onnx`](crate::inference) next to the other ONNX backends.

use crate::audio::{AudioSignal, DecodedAudio};
use crate::error::Result;

/// Longest input handed to a separator, in seconds.
pub const MAX_SEPARATION_SECS: f32 = 60.0;

pub trait SourceSeparator: Send + Sync {
    /// Extract the configured stem from `audio`, downmixed to mono.
    ///
    /// # Errors
    /// `Prediction` if the separation model fails.
    fn separate(&self, audio: &DecodedAudio) -> Result<AudioSignal>;
}

/// Returns the input downmixed to mono. Used when no separation model is
/// deployed and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSeparator;

impl SourceSeparator for PassthroughSeparator {
    fn separate(&self, audio: &DecodedAudio) -> Result<AudioSignal> {
        Ok(audio.to_mono())
    }
}
