//! Model contracts and the process-wide model registry.
//!
//! The pipeline never talks to a backend directly. It asks the
//! [`ModelRegistry`] for a model by [`ModelKey`] and gets back a shared
//! trait object:
//!
//! - [`Classifier`]: a batch of [`FeatureTensor`]s in, one score vector per
//!   tensor out (emotion, genre, instrument).
//! - [`VectorClassifier`]: a batch of flat feature rows in, one class index
//!   per row out (gender).
//! - [`SourceSeparator`]: decoded audio in, one mono stem out.
//!
//! Implementations take `&self` and must be safe to call from many request
//! threads at once. Backends that need exclusive access to native state
//! (ONNX sessions) serialise internally through a `parking_lot::Mutex`.
//!
//! The registry is populated once at startup and never mutated afterwards,
//! so lookups take no lock. A model that failed to load is remembered with
//! its failure reason; every request that needs it gets
//! [`AudiotagError::ModelUnavailable`] instead of a silent fallback.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{load_registry, OnnxClassifier, OnnxSeparator, OnnxVectorClassifier};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AudiotagError, Result};
use crate::features::FeatureTensor;
use crate::separation::SourceSeparator;

/// Per-class scores aligned to a task's label table.
pub type PredictionVector = Vec<f32>;

/// Contract for models consuming 2-D feature maps.
pub trait Classifier: Send + Sync {
    /// Score every tensor in `batch`; output order matches input order.
    ///
    /// # Errors
    /// `Prediction` on any backend failure.
    fn predict(&self, batch: &[FeatureTensor]) -> Result<Vec<PredictionVector>>;
}

/// Contract for models consuming flat feature vectors and emitting a class index.
pub trait VectorClassifier: Send + Sync {
    fn predict(&self, rows: &[Vec<f32>]) -> Result<Vec<usize>>;
}

/// Identifies one deployed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKey {
    EmotionSpectrogram,
    EmotionMfcc,
    EmotionMel,
    Gender,
    Genre,
    Instrument,
    Separator,
}

impl ModelKey {
    pub const ALL: [ModelKey; 7] = [
        ModelKey::EmotionSpectrogram,
        ModelKey::EmotionMfcc,
        ModelKey::EmotionMel,
        ModelKey::Gender,
        ModelKey::Genre,
        ModelKey::Instrument,
        ModelKey::Separator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKey::EmotionSpectrogram => "emotion_spectrogram",
            ModelKey::EmotionMfcc => "emotion_mfcc",
            ModelKey::EmotionMel => "emotion_mel",
            ModelKey::Gender => "gender",
            ModelKey::Genre => "genre",
            ModelKey::Instrument => "instrument",
            ModelKey::Separator => "separator",
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the model artifacts live. File names are relative to `dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub dir: PathBuf,
    pub emotion_spectrogram: String,
    pub emotion_mfcc: String,
    pub emotion_mel: String,
    pub gender: String,
    pub genre: String,
    pub instrument: String,
    /// `None` disables source separation entirely.
    pub separator: Option<String>,
    /// Which output stem the separator keeps.
    pub separator_stem: usize,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            emotion_spectrogram: "emotion_spectrogram.onnx".into(),
            emotion_mfcc: "emotion_mfcc.onnx".into(),
            emotion_mel: "emotion_mel.onnx".into(),
            gender: "gender.onnx".into(),
            genre: "genre.onnx".into(),
            instrument: "instrument.onnx".into(),
            separator: Some("separator.onnx".into()),
            separator_stem: 1,
        }
    }
}

impl ModelPaths {
    /// Full path of the artifact for `key`; `None` when the model is not configured.
    pub fn path(&self, key: ModelKey) -> Option<PathBuf> {
        let file = match key {
            ModelKey::EmotionSpectrogram => &self.emotion_spectrogram,
            ModelKey::EmotionMfcc => &self.emotion_mfcc,
            ModelKey::EmotionMel => &self.emotion_mel,
            ModelKey::Gender => &self.gender,
            ModelKey::Genre => &self.genre,
            ModelKey::Instrument => &self.instrument,
            ModelKey::Separator => self.separator.as_ref()?,
        };
        let file = file.trim();
        (!file.is_empty()).then(|| self.dir.join(file))
    }
}

pub fn default_models_dir() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("audiotag")
        .join("models")
}

/// Read-only set of loaded models, shared as `Arc<ModelRegistry>`.
#[derive(Default)]
pub struct ModelRegistry {
    classifiers: HashMap<ModelKey, Arc<dyn Classifier>>,
    vector_classifiers: HashMap<ModelKey, Arc<dyn VectorClassifier>>,
    separator: Option<Arc<dyn SourceSeparator>>,
    failures: HashMap<ModelKey, String>,
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// # Errors
    /// `ModelUnavailable` when `key` was never registered or failed to load.
    pub fn classifier(&self, key: ModelKey) -> Result<Arc<dyn Classifier>> {
        self.classifiers
            .get(&key)
            .cloned()
            .ok_or_else(|| self.unavailable(key))
    }

    pub fn vector_classifier(&self, key: ModelKey) -> Result<Arc<dyn VectorClassifier>> {
        self.vector_classifiers
            .get(&key)
            .cloned()
            .ok_or_else(|| self.unavailable(key))
    }

    pub fn separator(&self) -> Result<Arc<dyn SourceSeparator>> {
        self.separator
            .clone()
            .ok_or_else(|| self.unavailable(ModelKey::Separator))
    }

    pub fn is_loaded(&self, key: ModelKey) -> bool {
        match key {
            ModelKey::Separator => self.separator.is_some(),
            ModelKey::Gender => self.vector_classifiers.contains_key(&key),
            _ => self.classifiers.contains_key(&key),
        }
    }

    /// Fail fast unless every model in `keys` is available.
    pub fn require(&self, keys: &[ModelKey]) -> Result<()> {
        match keys.iter().find(|k| !self.is_loaded(**k)) {
            Some(missing) => Err(self.unavailable(*missing)),
            None => Ok(()),
        }
    }

    /// Load failures recorded at construction, by model.
    pub fn failures(&self) -> &HashMap<ModelKey, String> {
        &self.failures
    }

    fn unavailable(&self, key: ModelKey) -> AudiotagError {
        match self.failures.get(&key) {
            Some(reason) => AudiotagError::ModelUnavailable(format!("{key}: {reason}")),
            None => AudiotagError::ModelUnavailable(format!("{key}: not loaded")),
        }
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded: Vec<&str> = ModelKey::ALL
            .iter()
            .filter(|k| self.is_loaded(**k))
            .map(|k| k.name())
            .collect();
        f.debug_struct("ModelRegistry")
            .field("loaded", &loaded)
            .field("failures", &self.failures)
            .finish()
    }
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    inner: ModelRegistry,
}

impl ModelRegistryBuilder {
    pub fn classifier(mut self, key: ModelKey, model: Arc<dyn Classifier>) -> Self {
        self.inner.failures.remove(&key);
        self.inner.classifiers.insert(key, model);
        self
    }

    pub fn vector_classifier(mut self, key: ModelKey, model: Arc<dyn VectorClassifier>) -> Self {
        self.inner.failures.remove(&key);
        self.inner.vector_classifiers.insert(key, model);
        self
    }

    pub fn separator(mut self, separator: Arc<dyn SourceSeparator>) -> Self {
        self.inner.failures.remove(&ModelKey::Separator);
        self.inner.separator = Some(separator);
        self
    }

    /// Record that `key` could not be loaded.
    pub fn failed(mut self, key: ModelKey, reason: impl Into<String>) -> Self {
        self.inner.failures.insert(key, reason.into());
        self
    }

    pub fn build(self) -> ModelRegistry {
        self.inner
    }
}
