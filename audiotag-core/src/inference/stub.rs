//! Deterministic stand-in models.
//!
//! Used by the test suites and by the server's explicit `stub_models`
//! development switch, so the whole request path can be exercised without
//! model artifacts on disk. Stubs also record what they were fed, which lets
//! tests assert batch sizes and tensor shapes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AudiotagError, Result};
use crate::features::FeatureTensor;
use crate::inference::{Classifier, ModelKey, ModelRegistry, PredictionVector, VectorClassifier};
use crate::labels::{GENRES, INSTRUMENTS, MOODS};
use crate::separation::PassthroughSeparator;

type ScoreFn = dyn Fn(&FeatureTensor) -> PredictionVector + Send + Sync;

/// Scores every tensor with a fixed vector or a caller-supplied function.
pub struct StubClassifier {
    score: Box<ScoreFn>,
    expected_shape: Option<(usize, usize)>,
    tensors_seen: AtomicUsize,
    batches: Mutex<Vec<usize>>,
}

impl StubClassifier {
    /// Same scores for every input.
    pub fn fixed(scores: Vec<f32>) -> Self {
        Self::from_fn(move |_| scores.clone())
    }

    pub fn from_fn<F>(score: F) -> Self
    where
        F: Fn(&FeatureTensor) -> PredictionVector + Send + Sync + 'static,
    {
        Self {
            score: Box::new(score),
            expected_shape: None,
            tensors_seen: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Reject any tensor whose shape differs from `shape`, like a real model would.
    pub fn expecting_shape(mut self, shape: (usize, usize)) -> Self {
        self.expected_shape = Some(shape);
        self
    }

    /// Total tensors scored so far.
    pub fn tensors_seen(&self) -> usize {
        self.tensors_seen.load(Ordering::Relaxed)
    }

    /// Sizes of every batch received, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }
}

impl Classifier for StubClassifier {
    fn predict(&self, batch: &[FeatureTensor]) -> Result<Vec<PredictionVector>> {
        if let Some(expected) = self.expected_shape {
            if let Some(bad) = batch.iter().find(|t| t.shape() != expected) {
                return Err(AudiotagError::Prediction(format!(
                    "expected input {expected:?}, got {:?}",
                    bad.shape()
                )));
            }
        }
        self.tensors_seen.fetch_add(batch.len(), Ordering::Relaxed);
        self.batches.lock().push(batch.len());
        debug!(batch = batch.len(), "StubClassifier::predict");
        Ok(batch.iter().map(|t| (self.score)(t)).collect())
    }
}

type LabelFn = dyn Fn(&[f32]) -> usize + Send + Sync;

/// Labels every row with a fixed class or a caller-supplied function.
pub struct StubVectorClassifier {
    label: Box<LabelFn>,
    rows_seen: AtomicUsize,
}

impl StubVectorClassifier {
    pub fn fixed(label: usize) -> Self {
        Self::from_fn(move |_| label)
    }

    pub fn from_fn<F>(label: F) -> Self
    where
        F: Fn(&[f32]) -> usize + Send + Sync + 'static,
    {
        Self {
            label: Box::new(label),
            rows_seen: AtomicUsize::new(0),
        }
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen.load(Ordering::Relaxed)
    }
}

impl VectorClassifier for StubVectorClassifier {
    fn predict(&self, rows: &[Vec<f32>]) -> Result<Vec<usize>> {
        self.rows_seen.fetch_add(rows.len(), Ordering::Relaxed);
        Ok(rows.iter().map(|r| (self.label)(r)).collect())
    }
}

/// Descending scores `n, n-1, ..., 1` so the label table order is the ranking.
fn ranked_scores(n: usize) -> Vec<f32> {
    (0..n).map(|i| (n - i) as f32).collect()
}

/// A registry where every task is served by a stub.
pub fn stub_registry() -> ModelRegistry {
    let emotion = Arc::new(StubClassifier::fixed(ranked_scores(MOODS.len())));
    ModelRegistry::builder()
        .classifier(ModelKey::EmotionSpectrogram, emotion.clone())
        .classifier(ModelKey::EmotionMfcc, emotion.clone())
        .classifier(ModelKey::EmotionMel, emotion)
        .classifier(
            ModelKey::Genre,
            Arc::new(StubClassifier::fixed(ranked_scores(GENRES.len()))),
        )
        .classifier(
            ModelKey::Instrument,
            Arc::new(StubClassifier::fixed(ranked_scores(INSTRUMENTS.len()))),
        )
        .vector_classifier(ModelKey::Gender, Arc::new(StubVectorClassifier::fixed(1)))
        .separator(Arc::new(PassthroughSeparator))
        .build()
}
