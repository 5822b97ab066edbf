//! Spectral frontend: STFT, mel filterbank, decibel scaling, DCT.
//!
//! ## Conventions (must match the representations the models were trained on)
//!
//! | Parameter       | Value                           |
//! |-----------------|---------------------------------|
//! | Hann window     | periodic, `n_fft` samples       |
//! | FFT size        | 2048                            |
//! | Frequency bins  | 1025 (2048/2+1)                 |
//! | Hop length      | 512                             |
//! | Framing         | centred, zero padded n_fft/2    |
//! | Mel scale       | Slaney, area-normalised filters |
//! | power → dB      | amin 1e-10, top_db 80           |
//! | amplitude → dB  | amin 1e-5, top_db 80            |
//! | MFCC            | orthonormal DCT-II of power dB  |

use std::sync::Arc;

use ndarray::{s, Array2};
use rustfft::{num_complex::Complex, Fft, FftPlanner};

pub const N_FFT: usize = 2048;
pub const HOP: usize = 512;
pub const TOP_DB: f32 = 80.0;
const POWER_AMIN: f32 = 1e-10;
const AMPLITUDE_AMIN: f32 = 1e-5;

/// Reference level subtracted during decibel conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DbReference {
    /// 0 dB at a value of 1.0.
    Unit,
    /// 0 dB at the largest value of the input.
    Peak,
}

pub struct SpectralFrontend {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectralFrontend {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        Self {
            n_fft,
            hop: hop.max(1),
            window: build_hann_window(n_fft),
            fft: FftPlanner::<f32>::new().plan_fft_forward(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    /// Number of positive-frequency bins.
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Frames produced for `len` input samples with centred framing.
    pub fn n_frames(&self, len: usize) -> usize {
        1 + len / self.hop
    }

    /// STFT magnitude, shape `(n_freqs, n_frames)`.
    pub fn stft_magnitude(&self, samples: &[f32]) -> Array2<f32> {
        let pad = self.n_fft / 2;
        let n_frames = self.n_frames(samples.len());
        let n_freqs = self.n_freqs();
        let mut padded = vec![0.0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let mut magnitudes = Array2::<f32>::zeros((n_freqs, n_frames));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        for frame in 0..n_frames {
            let start = frame * self.hop;
            for (i, v) in buffer.iter_mut().enumerate() {
                *v = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process_with_scratch(&mut buffer, &mut scratch);
            for (k, c) in buffer.iter().take(n_freqs).enumerate() {
                magnitudes[[k, frame]] = c.norm();
            }
        }
        magnitudes
    }

    /// Squared STFT magnitude, shape `(n_freqs, n_frames)`.
    pub fn power_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        let mut power = self.stft_magnitude(samples);
        power.mapv_inplace(|m| m * m);
        power
    }
}

pub fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Slaney-style mel filterbank, shape `(n_mels, n_fft/2 + 1)`.
pub fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Array2<f32> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / down_denom;
            let falling = (upper - freq) / up_denom;
            filters[[m, k]] = rising.min(falling).max(0.0) * enorm;
        }
    }
    filters
}

/// Orthonormal DCT-II basis, shape `(n_out, n_in)`; row `k` is coefficient `k`.
pub fn build_dct_matrix(n_out: usize, n_in: usize) -> Array2<f32> {
    use std::f64::consts::PI;
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 {
            (1.0 / n).sqrt()
        } else {
            (2.0 / n).sqrt()
        };
        (scale * (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos()) as f32
    })
}

/// Power spectrogram to decibels, clamped to `TOP_DB` below the maximum.
pub fn power_to_db(power: &Array2<f32>, reference: DbReference) -> Array2<f32> {
    let ref_value = match reference {
        DbReference::Unit => 1.0,
        DbReference::Peak => power.iter().copied().fold(0.0f32, f32::max),
    };
    to_db(power, 10.0, POWER_AMIN, ref_value)
}

/// Amplitude spectrogram to decibels, clamped to `TOP_DB` below the maximum.
pub fn amplitude_to_db(amplitude: &Array2<f32>, reference: DbReference) -> Array2<f32> {
    let ref_value = match reference {
        DbReference::Unit => 1.0,
        DbReference::Peak => amplitude.iter().fold(0.0f32, |m, v| m.max(v.abs())),
    };
    to_db(&amplitude.mapv(f32::abs), 20.0, AMPLITUDE_AMIN, ref_value)
}

fn to_db(values: &Array2<f32>, factor: f32, amin: f32, ref_value: f32) -> Array2<f32> {
    let offset = factor * ref_value.max(amin).log10();
    let mut db = values.mapv(|v| factor * v.max(amin).log10() - offset);
    let max_db = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_db.is_finite() {
        let floor = max_db - TOP_DB;
        db.mapv_inplace(|v| v.max(floor));
    }
    db
}

/// Mean over frames (axis 1) of a `(coefficients, frames)` matrix.
pub fn frame_mean(matrix: &Array2<f32>) -> Vec<f32> {
    let frames = matrix.ncols().max(1) as f32;
    (0..matrix.nrows())
        .map(|r| matrix.slice(s![r, ..]).sum() / frames)
        .collect()
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}
