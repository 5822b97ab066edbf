//! Overlapping fixed-duration windowing.
//!
//! ```text
//! |<── chunk ──>|
//!         |<── chunk ──>|
//!                 |<── chunk ──>|
//!                          |<── chunk ──>|   ← tail window pulled back (BackFill)
//! |<stride>|
//! ```
//!
//! `stride = chunk - overlap`. With [`TailPolicy::BackFill`] every window of a
//! signal at least one chunk long has exactly `chunk` samples; the last start
//! is shifted backwards rather than emitting a short window.
//! [`TailPolicy::Truncate`] instead starts windows at every stride inside the
//! signal and lets the tail windows run short.

pub mod chunk;

use serde::{Deserialize, Serialize};

pub use chunk::Chunk;

use crate::audio::AudioSignal;
use crate::error::{AudiotagError, Result};

/// What to do with a window that would run past the end of the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailPolicy {
    /// Shift the window back so it ends at the last sample.
    BackFill,
    /// Keep the start and emit a shorter window.
    Truncate,
}

/// Window geometry in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub chunk_duration_s: f32,
    pub overlap_duration_s: f32,
    /// Upper bound on emitted windows; `None` is unbounded.
    pub max_chunks: Option<usize>,
    pub tail: TailPolicy,
}

impl ChunkSpec {
    pub fn new(chunk_duration_s: f32, overlap_duration_s: f32) -> Self {
        Self {
            chunk_duration_s,
            overlap_duration_s,
            max_chunks: None,
            tail: TailPolicy::BackFill,
        }
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }

    pub fn with_tail(mut self, tail: TailPolicy) -> Self {
        self.tail = tail;
        self
    }

    /// `(chunk_samples, stride_samples)` at `sample_rate`.
    ///
    /// # Errors
    /// `InvalidRequest` unless `0 <= overlap < chunk` and the chunk spans at
    /// least one sample.
    pub fn geometry(&self, sample_rate: u32) -> Result<(usize, usize)> {
        if !self.chunk_duration_s.is_finite()
            || !self.overlap_duration_s.is_finite()
            || self.chunk_duration_s <= 0.0
            || self.overlap_duration_s < 0.0
            || self.overlap_duration_s >= self.chunk_duration_s
        {
            return Err(AudiotagError::InvalidRequest(format!(
                "chunk duration {}s / overlap {}s: overlap must be in [0, chunk)",
                self.chunk_duration_s, self.overlap_duration_s
            )));
        }
        if self.max_chunks == Some(0) {
            return Err(AudiotagError::InvalidRequest(
                "max_chunks must be at least 1".into(),
            ));
        }
        let chunk = (self.chunk_duration_s as f64 * sample_rate as f64).round() as usize;
        let overlap = (self.overlap_duration_s as f64 * sample_rate as f64).round() as usize;
        if chunk == 0 || overlap >= chunk {
            return Err(AudiotagError::InvalidRequest(format!(
                "chunk of {chunk} samples with {overlap} overlap at {sample_rate} Hz"
            )));
        }
        Ok((chunk, chunk - overlap))
    }
}

/// Number of back-filled windows for a signal of `len` samples:
/// `ceil((len - chunk) / stride) + 1`, never less than one for a non-empty signal.
pub fn window_count(len: usize, chunk: usize, stride: usize) -> usize {
    if len == 0 {
        return 0;
    }
    if len <= chunk {
        return 1;
    }
    (len - chunk).div_ceil(stride) + 1
}

/// Split `signal` into windows according to `spec`.
///
/// An empty signal yields no windows. A signal shorter than one chunk yields a
/// single window covering all of it; the feature resize stage stretches it to
/// the model shape.
pub fn chunk_signal<'a>(signal: &'a AudioSignal, spec: &ChunkSpec) -> Result<Vec<Chunk<'a>>> {
    let (chunk, stride) = spec.geometry(signal.sample_rate)?;
    let len = signal.samples.len();
    let cap = spec.max_chunks.unwrap_or(usize::MAX);

    let windows: Vec<(usize, usize)> = match spec.tail {
        TailPolicy::BackFill => {
            let count = window_count(len, chunk, stride).min(cap);
            (0..count)
                .map(|i| {
                    let mut start = i * stride;
                    let mut end = start + chunk;
                    if end > len {
                        end = len;
                        start = end.saturating_sub(chunk);
                    }
                    (start, end)
                })
                .collect()
        }
        TailPolicy::Truncate => (0..len)
            .step_by(stride)
            .take(cap)
            .map(|start| (start, (start + chunk).min(len)))
            .collect(),
    };

    Ok(windows
        .into_iter()
        .map(|(start, end)| Chunk::new(&signal.samples[start..end], signal.sample_rate, start))
        .collect())
}

/// The whole signal as a single window.
pub fn whole_signal(signal: &AudioSignal) -> Vec<Chunk<'_>> {
    if signal.is_empty() {
        return Vec::new();
    }
    vec![Chunk::new(&signal.samples, signal.sample_rate, 0)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(len: usize, sample_rate: u32) -> AudioSignal {
        AudioSignal::new((0..len).map(|i| i as f32).collect(), sample_rate)
    }

    #[test]
    fn forty_five_seconds_four_by_two() {
        let sr = 22_050;
        let s = signal(45 * sr as usize, sr);
        let chunks = chunk_signal(&s, &ChunkSpec::new(4.0, 2.0)).unwrap();
        let expected = ((45.0 * sr as f64 - 4.0 * sr as f64) / (2.0 * sr as f64)).ceil() as usize + 1;
        assert_eq!(chunks.len(), expected);
        assert_eq!(chunks.len(), 22);
        assert!(chunks.iter().all(|c| c.len() == 4 * sr as usize));
    }

    #[test]
    fn tail_window_is_pulled_back() {
        let s = signal(10, 1);
        let chunks = chunk_signal(&s, &ChunkSpec::new(4.0, 1.0)).unwrap();
        // stride 3: starts 0, 3, then 6 would end at 10 exactly; count = ceil(6/3)+1 = 3
        let starts: Vec<usize> = chunks.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![0, 3, 6]);

        let s = signal(11, 1);
        let chunks = chunk_signal(&s, &ChunkSpec::new(4.0, 1.0)).unwrap();
        let starts: Vec<usize> = chunks.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![0, 3, 6, 7]);
        assert_eq!(chunks[3].samples, &s.samples[7..11]);
    }

    #[test]
    fn short_signal_gives_one_whole_window() {
        let s = signal(5, 2);
        let chunks = chunk_signal(&s, &ChunkSpec::new(4.0, 2.0)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].len(), 5);
    }

    #[test]
    fn empty_signal_gives_no_windows() {
        let s = signal(0, 22_050);
        assert!(chunk_signal(&s, &ChunkSpec::new(4.0, 2.0)).unwrap().is_empty());
        assert!(whole_signal(&s).is_empty());
    }

    #[test]
    fn max_chunks_caps_output() {
        let s = signal(60 * 100, 100);
        let chunks = chunk_signal(&s, &ChunkSpec::new(4.0, 2.0).with_max_chunks(5)).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].start, 4 * 200);
    }

    #[test]
    fn window_bounds_hold_across_geometries() {
        for sr in [7u32, 100, 441] {
            for (chunk_s, overlap_s) in [(1.0f32, 0.0f32), (2.0, 1.5), (4.0, 2.0), (3.0, 0.5)] {
                for max in [None, Some(1), Some(3)] {
                    for len in [1usize, 10, 99, 1_000, 4_321] {
                        let s = signal(len, sr);
                        let mut spec = ChunkSpec::new(chunk_s, overlap_s);
                        spec.max_chunks = max;
                        let (chunk, _) = spec.geometry(sr).unwrap();
                        let chunks = chunk_signal(&s, &spec).unwrap();
                        assert!(!chunks.is_empty());
                        assert!(chunks.len() <= max.unwrap_or(usize::MAX));
                        for c in &chunks {
                            if len >= chunk {
                                assert_eq!(c.len(), chunk, "sr={sr} len={len}");
                            } else {
                                assert_eq!(c.len(), len);
                            }
                            assert!(c.start + c.len() <= len);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn truncate_policy_matches_stride_loop() {
        let s = signal(100, 10);
        let spec = ChunkSpec::new(3.0, 1.0).with_tail(TailPolicy::Truncate);
        let chunks = chunk_signal(&s, &spec).unwrap();
        // starts every 20 samples: 0, 20, 40, 60, 80
        let starts: Vec<usize> = chunks.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![0, 20, 40, 60, 80]);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![30, 30, 30, 30, 20]);
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let s = signal(100, 10);
        for spec in [
            ChunkSpec::new(2.0, 2.0),
            ChunkSpec::new(2.0, 3.0),
            ChunkSpec::new(0.0, 0.0),
            ChunkSpec::new(2.0, -1.0),
            ChunkSpec::new(2.0, 1.0).with_max_chunks(0),
        ] {
            let err = chunk_signal(&s, &spec).unwrap_err();
            assert!(matches!(err, AudiotagError::InvalidRequest(_)), "{spec:?}");
        }
    }
}
