//! Per-chunk spectral representations at model-specific shapes.
//!
//! ```text
//!  chunk samples ──► STFT ──┬──► |X|        ──► amplitude dB ──────────────┐
//!                           │                                              │
//!                           └──► |X|² ──► mel ──┬──► power / amplitude dB ─┼──► resize ──► FeatureTensor
//!                                               │       (z-score opt.)     │
//!                                               └──► power dB ──► DCT ─────┘
//! ```
//!
//! Resizing to the requested shape is unconditional, so a tensor handed to a
//! model always has exactly the shape in its [`FeatureSpec`].

pub mod resize;
pub mod spectral;

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use resize::{resize, ResizeMode};
pub use spectral::DbReference;

use crate::chunking::Chunk;
use crate::error::{AudiotagError, Result};
use spectral::{
    amplitude_to_db, build_dct_matrix, build_mel_filters, frame_mean, power_to_db,
    SpectralFrontend, HOP, N_FFT,
};

/// Mel band count used for MFCC computation.
pub const MFCC_MEL_BANDS: usize = 128;

/// Which decibel conversion follows the mel projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbScale {
    /// `10 * log10(S)`.
    Power,
    /// `20 * log10(S)` applied to the mel power values.
    Amplitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MelOptions {
    pub n_mels: usize,
    /// Upper filterbank edge in Hz; `None` means Nyquist.
    #[serde(default)]
    pub fmax: Option<f32>,
    pub db: DbScale,
    /// Z-score the dB values (`(x - mean) / (std + 1e-6)`) before resizing.
    #[serde(default)]
    pub standardize: bool,
}

impl MelOptions {
    pub fn power_db(n_mels: usize) -> Self {
        Self {
            n_mels,
            fmax: None,
            db: DbScale::Power,
            standardize: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// STFT magnitude in amplitude dB, referenced to 1.0.
    SpectrogramDb,
    /// First `n_mfcc` cepstral coefficients.
    Mfcc { n_mfcc: usize },
    /// Mel spectrogram in dB, referenced to the chunk's own peak.
    MelDb(MelOptions),
}

/// A feature kind plus the exact shape and resize routine its model expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub kind: FeatureKind,
    /// `(height, width)` of the model input, channel excluded.
    pub shape: (usize, usize),
    pub resize: ResizeMode,
}

impl FeatureSpec {
    pub fn new(kind: FeatureKind, shape: (usize, usize), resize: ResizeMode) -> Self {
        Self {
            kind,
            shape,
            resize,
        }
    }
}

/// A 2-D feature map at its model's input shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    data: Array2<f32>,
}

impl FeatureTensor {
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ndarray::ArrayView2<'_, f32> {
        self.data.view()
    }
}

type MelKey = (u32, usize, u32);

/// Computes [`FeatureTensor`]s from raw samples.
///
/// Mel filterbanks and DCT bases are built on first use per
/// `(sample_rate, n_mels, fmax)` and reused for every later chunk and request.
pub struct FeatureExtractor {
    frontend: SpectralFrontend,
    mel_filters: Mutex<HashMap<MelKey, Arc<Array2<f32>>>>,
    dct_bases: Mutex<HashMap<(usize, usize), Arc<Array2<f32>>>>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self {
            frontend: SpectralFrontend::new(N_FFT, HOP),
            mel_filters: Mutex::new(HashMap::new()),
            dct_bases: Mutex::new(HashMap::new()),
        }
    }

    /// Representation for `chunk` resized to `spec.shape`.
    pub fn extract_chunk(&self, chunk: &Chunk<'_>, spec: &FeatureSpec) -> Result<FeatureTensor> {
        self.extract(chunk.samples, chunk.sample_rate, spec)
    }

    /// Representation of `samples` (declared at `sample_rate`) resized to `spec.shape`.
    ///
    /// # Errors
    /// `InvalidAudio` for an empty input, `InvalidRequest` for a target shape
    /// with a zero dimension or a zero coefficient/band count.
    pub fn extract(&self, samples: &[f32], sample_rate: u32, spec: &FeatureSpec) -> Result<FeatureTensor> {
        let (rows, cols) = spec.shape;
        if rows == 0 || cols == 0 {
            return Err(AudiotagError::InvalidRequest(format!(
                "feature shape {rows}x{cols} has a zero dimension"
            )));
        }
        let raw = self.representation(samples, sample_rate, &spec.kind)?;
        Ok(FeatureTensor::new(resize(&raw, spec.shape, spec.resize)))
    }

    /// The 2-D representation before resizing, `(bins, frames)`.
    pub fn representation(&self, samples: &[f32], sample_rate: u32, kind: &FeatureKind) -> Result<Array2<f32>> {
        if samples.is_empty() {
            return Err(AudiotagError::InvalidAudio("empty chunk".into()));
        }
        if sample_rate == 0 {
            return Err(AudiotagError::InvalidAudio("zero sample rate".into()));
        }
        match *kind {
            FeatureKind::SpectrogramDb => {
                let magnitude = self.frontend.stft_magnitude(samples);
                Ok(amplitude_to_db(&magnitude, DbReference::Unit))
            }
            FeatureKind::Mfcc { n_mfcc } => self.mfcc(samples, sample_rate, n_mfcc),
            FeatureKind::MelDb(options) => {
                let mel = self.mel_power(samples, sample_rate, options.n_mels, options.fmax)?;
                let mut db = match options.db {
                    DbScale::Power => power_to_db(&mel, DbReference::Peak),
                    DbScale::Amplitude => amplitude_to_db(&mel, DbReference::Peak),
                };
                if options.standardize {
                    standardize(&mut db);
                }
                Ok(db)
            }
        }
    }

    /// Mean over frames of the first `n_mfcc` coefficients.
    pub fn mfcc_mean(&self, samples: &[f32], sample_rate: u32, n_mfcc: usize) -> Result<Vec<f32>> {
        if samples.is_empty() {
            return Err(AudiotagError::InvalidAudio("empty chunk".into()));
        }
        Ok(frame_mean(&self.mfcc(samples, sample_rate, n_mfcc)?))
    }

    fn mfcc(&self, samples: &[f32], sample_rate: u32, n_mfcc: usize) -> Result<Array2<f32>> {
        if n_mfcc == 0 {
            return Err(AudiotagError::InvalidRequest("n_mfcc must be at least 1".into()));
        }
        let mel = self.mel_power(samples, sample_rate, MFCC_MEL_BANDS, None)?;
        let log_mel = power_to_db(&mel, DbReference::Unit);
        let dct = {
            let mut bases = self.dct_bases.lock();
            bases
                .entry((n_mfcc, MFCC_MEL_BANDS))
                .or_insert_with(|| Arc::new(build_dct_matrix(n_mfcc, MFCC_MEL_BANDS)))
                .clone()
        };
        Ok(dct.dot(&log_mel))
    }

    fn mel_power(&self, samples: &[f32], sample_rate: u32, n_mels: usize, fmax: Option<f32>) -> Result<Array2<f32>> {
        if n_mels == 0 {
            return Err(AudiotagError::InvalidRequest("n_mels must be at least 1".into()));
        }
        let nyquist = sample_rate as f32 / 2.0;
        let fmax = fmax.unwrap_or(nyquist).min(nyquist);
        let filters = {
            let mut cache = self.mel_filters.lock();
            cache
                .entry((sample_rate, n_mels, fmax.to_bits()))
                .or_insert_with(|| {
                    Arc::new(build_mel_filters(self.frontend.n_fft(), sample_rate, n_mels, 0.0, fmax))
                })
                .clone()
        };
        let power = self.frontend.power_spectrogram(samples);
        Ok(filters.dot(&power))
    }
}

fn standardize(values: &mut Array2<f32>) {
    let n = values.len().max(1) as f32;
    let mean = values.sum() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let denom = var.sqrt() + 1e-6;
    values.mapv_inplace(|v| (v - mean) / denom);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tone(sr: u32, secs: f32) -> Vec<f32> {
        use std::f32::consts::PI;
        let n = (sr as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.3 * (2.0 * PI * 440.0 * i as f32 / sr as f32).sin())
            .collect()
    }

    fn specs() -> Vec<FeatureSpec> {
        vec![
            FeatureSpec::new(FeatureKind::SpectrogramDb, (300, 300), ResizeMode::Tile),
            FeatureSpec::new(FeatureKind::Mfcc { n_mfcc: 20 }, (120, 600), ResizeMode::Tile),
            FeatureSpec::new(
                FeatureKind::MelDb(MelOptions {
                    n_mels: 128,
                    fmax: None,
                    db: DbScale::Amplitude,
                    standardize: false,
                }),
                (300, 400),
                ResizeMode::Tile,
            ),
            FeatureSpec::new(
                FeatureKind::MelDb(MelOptions {
                    n_mels: 128,
                    fmax: Some(8_000.0),
                    db: DbScale::Power,
                    standardize: true,
                }),
                (128, 128),
                ResizeMode::Tile,
            ),
            FeatureSpec::new(
                FeatureKind::MelDb(MelOptions::power_db(128)),
                (128, 128),
                ResizeMode::Bilinear,
            ),
        ]
    }

    #[test]
    fn output_shape_equals_requested_shape_for_any_length() {
        let extractor = FeatureExtractor::new();
        for len_secs in [0.001f32, 0.3, 1.0, 4.0] {
            let samples = tone(22_050, len_secs);
            for spec in specs() {
                let tensor = extractor.extract(&samples, 22_050, &spec).unwrap();
                assert_eq!(tensor.shape(), spec.shape, "{spec:?} at {len_secs}s");
                assert!(tensor.view().iter().all(|v| v.is_finite()));
            }
        }
    }

    #[test]
    fn empty_chunk_is_invalid_audio() {
        let extractor = FeatureExtractor::new();
        for spec in specs() {
            let err = extractor.extract(&[], 22_050, &spec).unwrap_err();
            assert!(matches!(err, AudiotagError::InvalidAudio(_)));
        }
        assert!(matches!(
            extractor.mfcc_mean(&[], 22_050, 128),
            Err(AudiotagError::InvalidAudio(_))
        ));
    }

    #[test]
    fn zero_dimension_shape_is_rejected() {
        let extractor = FeatureExtractor::new();
        let spec = FeatureSpec::new(FeatureKind::SpectrogramDb, (0, 10), ResizeMode::Tile);
        assert!(matches!(
            extractor.extract(&tone(8_000, 0.5), 8_000, &spec),
            Err(AudiotagError::InvalidRequest(_))
        ));
    }

    #[test]
    fn raw_mel_dims_follow_frames() {
        let extractor = FeatureExtractor::new();
        let samples = tone(22_050, 4.0);
        let raw = extractor
            .representation(&samples, 22_050, &FeatureKind::MelDb(MelOptions::power_db(128)))
            .unwrap();
        assert_eq!(raw.dim(), (128, 1 + samples.len() / HOP));
        let peak = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_abs_diff_eq!(peak, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn standardized_mel_has_zero_mean_unit_std() {
        let extractor = FeatureExtractor::new();
        let raw = extractor
            .representation(
                &tone(22_050, 2.0),
                22_050,
                &FeatureKind::MelDb(MelOptions {
                    n_mels: 128,
                    fmax: Some(8_000.0),
                    db: DbScale::Power,
                    standardize: true,
                }),
            )
            .unwrap();
        let n = raw.len() as f32;
        let mean = raw.sum() / n;
        let std = (raw.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(std, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn mfcc_mean_has_one_value_per_coefficient() {
        let extractor = FeatureExtractor::new();
        let mean = extractor.mfcc_mean(&tone(16_000, 1.5), 16_000, 128).unwrap();
        assert_eq!(mean.len(), 128);
        // c0 of a non-silent signal carries the overall log energy
        assert!(mean[0].abs() > mean[127].abs());
    }

    #[test]
    fn filterbanks_are_cached_per_rate() {
        let extractor = FeatureExtractor::new();
        let kind = FeatureKind::MelDb(MelOptions::power_db(64));
        extractor.representation(&tone(22_050, 0.5), 22_050, &kind).unwrap();
        extractor.representation(&tone(22_050, 0.7), 22_050, &kind).unwrap();
        extractor.representation(&tone(16_000, 0.5), 16_000, &kind).unwrap();
        assert_eq!(extractor.mel_filters.lock().len(), 2);
    }
}
