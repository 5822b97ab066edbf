//! Decoded audio containers and the decode/resample helpers that produce them.
//!
//! ```text
//! bytes ──decode──► DecodedAudio (interleaved, N channels)
//!                        │
//!                    to_mono()
//!                        ▼
//!                   AudioSignal ──resample──► AudioSignal @ target rate
//! ```

pub mod decode;
pub mod resample;

pub use decode::decode_bytes;
pub use resample::resample;

/// A mono f32 signal at a known sample rate.
///
/// Owned by the request that decoded it and never shared across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSignal {
    /// Mono samples, nominally in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz, always > 0.
    pub sample_rate: u32,
}

impl AudioSignal {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Scale so the loudest sample has magnitude 1.0. Silent signals are left untouched.
    pub fn peak_normalized(mut self) -> Self {
        let peak = self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > 0.0 && peak.is_finite() {
            for s in self.samples.iter_mut() {
                *s /= peak;
            }
        }
        self
    }
}

/// Interleaved decoder output, before channel mixing.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Keep at most `max_seconds` of audio.
    pub fn truncated(mut self, max_seconds: f32) -> Self {
        if max_seconds > 0.0 {
            let max_frames = (max_seconds * self.sample_rate as f32) as usize;
            let max_samples = max_frames.saturating_mul(self.channels.max(1) as usize);
            self.samples.truncate(max_samples);
        }
        self
    }

    /// De-interleave into one `Vec` per channel.
    pub fn planar(&self) -> Vec<Vec<f32>> {
        let channels = self.channels.max(1) as usize;
        let mut out = vec![Vec::with_capacity(self.frames()); channels];
        for frame in self.samples.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                out[ch].push(s);
            }
        }
        out
    }

    /// Average all channels into a mono signal.
    pub fn to_mono(&self) -> AudioSignal {
        let channels = self.channels.max(1) as usize;
        let samples = if channels == 1 {
            self.samples.clone()
        } else {
            self.samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        AudioSignal::new(samples, self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_downmix_averages_channels() {
        let decoded = DecodedAudio {
            samples: vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0],
            sample_rate: 8_000,
            channels: 2,
        };
        let mono = decoded.to_mono();
        assert_eq!(mono.samples, vec![0.5, 0.5, 0.0]);
        assert_eq!(mono.sample_rate, 8_000);
    }

    #[test]
    fn planar_splits_channels() {
        let decoded = DecodedAudio {
            samples: vec![1.0, 2.0, 3.0, 4.0],
            sample_rate: 8_000,
            channels: 2,
        };
        assert_eq!(decoded.planar(), vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn truncation_keeps_whole_frames() {
        let decoded = DecodedAudio {
            samples: vec![0.0; 2 * 10],
            sample_rate: 4,
            channels: 2,
        }
        .truncated(1.5);
        assert_eq!(decoded.frames(), 6);
    }

    #[test]
    fn peak_normalize_scales_to_unit() {
        let s = AudioSignal::new(vec![0.25, -0.5, 0.1], 100).peak_normalized();
        assert_eq!(s.samples, vec![0.5, -1.0, 0.2]);
        let silent = AudioSignal::new(vec![0.0; 4], 100).peak_normalized();
        assert_eq!(silent.samples, vec![0.0; 4]);
    }
}
