//! Typed window over a decoded signal, handed from the chunker to feature extraction.

/// A contiguous window of mono samples borrowed from an [`AudioSignal`](crate::audio::AudioSignal).
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Window samples.
    pub samples: &'a [f32],
    /// Sample rate in Hz of the parent signal.
    pub sample_rate: u32,
    /// Offset of the first sample within the parent signal.
    pub start: usize,
}

impl<'a> Chunk<'a> {
    pub fn new(samples: &'a [f32], sample_rate: u32, start: usize) -> Self {
        Self {
            samples,
            sample_rate,
            start,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
