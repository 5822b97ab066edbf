//! Fitting a 2-D representation to a fixed model input shape.
//!
//! Two modes exist because the models were trained against two different
//! resize routines:
//!
//! - [`ResizeMode::Tile`] flattens row-major and cycles (or truncates) the
//!   values into the target shape. No interpolation happens; an upscaled
//!   input repeats from its first value.
//! - [`ResizeMode::Bilinear`] samples at half-pixel centres with mirrored
//!   borders, after a Gaussian anti-alias pass on every downscaled axis
//!   (`sigma = (scale - 1) / 2`, truncated at four sigma).

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    Tile,
    Bilinear,
}

const GAUSSIAN_TRUNCATE: f32 = 4.0;

/// Resize `input` to `(rows, cols)` with `mode`. An empty input yields zeros.
pub fn resize(input: &Array2<f32>, shape: (usize, usize), mode: ResizeMode) -> Array2<f32> {
    if input.is_empty() {
        return Array2::zeros(shape);
    }
    match mode {
        ResizeMode::Tile => tile(input, shape),
        ResizeMode::Bilinear => bilinear(input, shape),
    }
}

fn tile(input: &Array2<f32>, (rows, cols): (usize, usize)) -> Array2<f32> {
    if input.dim() == (rows, cols) {
        return input.to_owned();
    }
    let flat: Vec<f32> = input.iter().copied().collect();
    let n = flat.len();
    Array2::from_shape_fn((rows, cols), |(r, c)| flat[(r * cols + c) % n])
}

fn bilinear(input: &Array2<f32>, (rows, cols): (usize, usize)) -> Array2<f32> {
    let (in_rows, in_cols) = input.dim();
    if (in_rows, in_cols) == (rows, cols) {
        return input.to_owned();
    }
    let row_scale = in_rows as f32 / rows.max(1) as f32;
    let col_scale = in_cols as f32 / cols.max(1) as f32;

    let mut smoothed = input.to_owned();
    let row_sigma = ((row_scale - 1.0) / 2.0).max(0.0);
    if row_sigma > 0.0 {
        smoothed = gaussian_along(&smoothed, Axis(0), row_sigma);
    }
    let col_sigma = ((col_scale - 1.0) / 2.0).max(0.0);
    if col_sigma > 0.0 {
        smoothed = gaussian_along(&smoothed, Axis(1), col_sigma);
    }

    let row_taps: Vec<Taps> = (0..rows).map(|r| Taps::new(r, row_scale, in_rows)).collect();
    let col_taps: Vec<Taps> = (0..cols).map(|c| Taps::new(c, col_scale, in_cols)).collect();

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let rt = &row_taps[r];
        let ct = &col_taps[c];
        let top = smoothed[[rt.lo, ct.lo]] * (1.0 - ct.frac) + smoothed[[rt.lo, ct.hi]] * ct.frac;
        let bottom = smoothed[[rt.hi, ct.lo]] * (1.0 - ct.frac) + smoothed[[rt.hi, ct.hi]] * ct.frac;
        top * (1.0 - rt.frac) + bottom * rt.frac
    })
}

/// Neighbouring source indices and interpolation weight for one output index.
struct Taps {
    lo: usize,
    hi: usize,
    frac: f32,
}

impl Taps {
    fn new(out_index: usize, scale: f32, len: usize) -> Self {
        let pos = (out_index as f32 + 0.5) * scale - 0.5;
        let base = pos.floor();
        let frac = pos - base;
        let base = base as isize;
        Self {
            lo: mirror_index(base, len),
            hi: mirror_index(base + 1, len),
            frac,
        }
    }
}

/// Reflect `index` about the edge samples (`d c b | a b c d | c b a`).
fn mirror_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let i = index.rem_euclid(period);
    if i >= len as isize {
        (period - i) as usize
    } else {
        i as usize
    }
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as isize;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|x| (-0.5 * (x as f32 / sigma).powi(2)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

fn gaussian_along(input: &Array2<f32>, axis: Axis, sigma: f32) -> Array2<f32> {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array2::<f32>::zeros(input.dim());
    for (src, mut dst) in input.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let len = src.len();
        for i in 0..len {
            dst[i] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * src[mirror_index(i as isize + k as isize - radius, len)])
                .sum();
        }
    }
    out
}
