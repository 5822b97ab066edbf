//! Reducing per-model and per-chunk predictions to one decision.
//!
//! | Task       | Policy                                                     |
//! |------------|------------------------------------------------------------|
//! | emotion    | majority vote over the three models' argmax, random tie-break |
//! | genre      | temperature softmax per chunk then mean, or plain mean     |
//! | instrument | plain mean, top six labels joined                          |
//! | gender     | chunk vote, `Male` only on a strict male majority          |
//!
//! Rankings use a stable descending sort, so equal scores keep label-table
//! order.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AudiotagError, Result};
use crate::inference::PredictionVector;
use crate::labels::Gender;

/// Index of the largest score; the first one wins on ties. `None` when empty.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if v <= b || v.is_nan() => best,
            _ if v.is_nan() => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Most frequent class; ties broken uniformly at random with `rng`.
pub fn majority_vote<R: Rng + ?Sized>(votes: &[usize], rng: &mut R) -> Option<usize> {
    let max_class = *votes.iter().max()?;
    let mut counts = vec![0usize; max_class + 1];
    for &v in votes {
        counts[v] += 1;
    }
    let top = counts.iter().copied().max().unwrap_or(0);
    let leaders: Vec<usize> = counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == top)
        .map(|(class, _)| class)
        .collect();
    leaders.choose(rng).copied()
}

/// `softmax(scores / temperature)` with the row maximum subtracted first.
pub fn softmax_with_temperature(scores: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let scaled: Vec<f32> = scores.iter().map(|s| s / t).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / scores.len().max(1) as f32; scores.len()]
    }
}

/// Element-wise mean of equally long vectors.
pub fn mean_vectors(vectors: &[PredictionVector]) -> Result<PredictionVector> {
    let first = vectors
        .first()
        .ok_or_else(|| AudiotagError::InvalidAudio("no predictions to aggregate".into()))?;
    let len = first.len();
    let mut sum = vec![0.0f64; len];
    for v in vectors {
        if v.len() != len {
            return Err(AudiotagError::Prediction(format!(
                "prediction length {} differs from {len}",
                v.len()
            )));
        }
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += *x as f64;
        }
    }
    let n = vectors.len() as f64;
    Ok(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Every vector must have exactly one score per label.
pub fn check_class_count(predictions: &[PredictionVector], labels: &[&str]) -> Result<()> {
    match predictions.iter().find(|p| p.len() != labels.len()) {
        Some(bad) => Err(AudiotagError::Prediction(format!(
            "model returned {} scores for {} classes",
            bad.len(),
            labels.len()
        ))),
        None => Ok(()),
    }
}

/// `(label, score)` pairs ordered by descending score.
pub fn rank_labels(scores: &[f32], labels: &[&str]) -> Vec<(String, f32)> {
    let mut ranked: Vec<(String, f32)> = labels
        .iter()
        .zip(scores)
        .map(|(label, &score)| (label.to_string(), score))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// How per-chunk genre scores are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenreMode {
    /// Softmax at a temperature per chunk, then the mean.
    #[default]
    TemperatureSoftmax,
    /// Mean of the raw model outputs.
    PlainMean,
}

impl std::str::FromStr for GenreMode {
    type Err = AudiotagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temperature_softmax" | "softmax" => Ok(GenreMode::TemperatureSoftmax),
            "plain_mean" | "mean" => Ok(GenreMode::PlainMean),
            other => Err(AudiotagError::InvalidRequest(format!(
                "unknown genre mode {other:?}"
            ))),
        }
    }
}

/// Aggregated genre scores, one per label.
pub fn aggregate_genre(
    predictions: &[PredictionVector],
    mode: GenreMode,
    temperature: f32,
) -> Result<PredictionVector> {
    match mode {
        GenreMode::TemperatureSoftmax => {
            let normalized: Vec<PredictionVector> = predictions
                .iter()
                .map(|p| softmax_with_temperature(p, temperature))
                .collect();
            mean_vectors(&normalized)
        }
        GenreMode::PlainMean => mean_vectors(predictions),
    }
}

/// Best label plus the `k` best `(label, score)` pairs.
pub fn top_k(scores: &[f32], labels: &[&str], k: usize) -> Result<(String, Vec<(String, f32)>)> {
    let mut ranked = rank_labels(scores, labels);
    ranked.truncate(k.max(1));
    let best = ranked
        .first()
        .map(|(label, _)| label.clone())
        .ok_or_else(|| AudiotagError::Prediction("no classes to rank".into()))?;
    Ok((best, ranked))
}

/// Mean over chunks, then the `k` best labels joined with `", "`.
pub fn top_k_joined(predictions: &[PredictionVector], labels: &[&str], k: usize) -> Result<String> {
    let mean = mean_vectors(predictions)?;
    Ok(rank_labels(&mean, labels)
        .into_iter()
        .take(k)
        .map(|(label, _)| label)
        .collect::<Vec<_>>()
        .join(", "))
}

/// `Male` only when male chunks strictly outnumber female chunks.
pub fn gender_vote(votes: &[Gender]) -> Gender {
    let male = votes.iter().filter(|g| **g == Gender::Male).count();
    let female = votes.len() - male;
    if male > female {
        Gender::Male
    } else {
        Gender::Female
    }
}
