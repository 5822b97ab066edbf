//! ONNX Runtime backends via the `ort` crate.
//!
//! | Backend                | Input                 | Output                          |
//! |------------------------|-----------------------|---------------------------------|
//! | [`OnnxClassifier`]     | `[N, H, W, 1]` f32    | `[N, C]` f32 scores             |
//! | [`OnnxVectorClassifier`] | `[N, D]` f32        | `[N]` i64 labels or `[N, C]` f32 |
//! | [`OnnxSeparator`]      | `[1, channels, frames]` | `[1, stems, channels, frames]` |
//!
//! `Session::run` needs `&mut Session`, so every session sits behind a
//! `parking_lot::Mutex`. Concurrent requests for the same model queue on that
//! lock; different models run in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Array4};
use ort::ep;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::argmax;
use crate::audio::{AudioSignal, DecodedAudio};
use crate::error::{AudiotagError, Result};
use crate::features::FeatureTensor;
use crate::inference::{
    Classifier, ModelKey, ModelPaths, ModelRegistry, PredictionVector, VectorClassifier,
};
use crate::separation::SourceSeparator;

fn create_session(model_path: &Path) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("AUDIOTAG_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(1, 8))
        .clamp(1, 32);
    let inter_threads = std::env::var("AUDIOTAG_ORT_INTER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 8);

    let session_err = |e: ort::Error| {
        AudiotagError::ModelUnavailable(format!("{}: {e}", model_path.display()))
    };
    let builder = SessionBuilder::new()
        .map_err(session_err)?
        .with_intra_threads(intra_threads)
        .map_err(session_err)?
        .with_inter_threads(inter_threads)
        .map_err(session_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(session_err)?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(session_err)?;
    debug!(intra_threads, inter_threads, logical_cores, "ONNX session threading configured");

    builder.commit_from_file(model_path).map_err(session_err)
}

/// Open `path`, logging the startup report for it.
fn open_reported(label: &str, path: &Path) -> Result<Session> {
    if !path.exists() {
        info!("  {label} {:?}: NOT FOUND", path);
        return Err(AudiotagError::ModelUnavailable(format!(
            "{} not found",
            path.display()
        )));
    }
    let size_mb = std::fs::metadata(path)
        .map(|m| m.len() as f64 / 1_048_576.0)
        .unwrap_or(0.0);
    info!("  {label} {:?}: {:.2} MB", path, size_mb);

    let session = create_session(path)?;
    let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
    let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
    info!("    inputs: {:?}", inputs);
    info!("    outputs: {:?}", outputs);
    Ok(session)
}

fn first_input_name(session: &Session) -> Result<String> {
    session
        .inputs()
        .first()
        .map(|i| i.name().to_string())
        .ok_or_else(|| AudiotagError::ModelUnavailable("model has no inputs".into()))
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

fn prediction_err(e: impl std::fmt::Display) -> AudiotagError {
    AudiotagError::Prediction(e.to_string())
}

// ── OnnxClassifier ──────────────────────────────────────────────────────────

/// CNN over `[N, H, W, 1]` feature maps.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
}

impl OnnxClassifier {
    pub fn load(path: &Path) -> Result<Self> {
        let session = open_reported("classifier", path)?;
        let input_name = first_input_name(&session)?;
        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, batch: &[FeatureTensor]) -> Result<Vec<PredictionVector>> {
        let Some(first) = batch.first() else {
            return Ok(Vec::new());
        };
        let (h, w) = first.shape();
        let mut input = Array4::<f32>::zeros((batch.len(), h, w, 1));
        for (i, tensor) in batch.iter().enumerate() {
            if tensor.shape() != (h, w) {
                return Err(AudiotagError::Prediction(format!(
                    "mixed tensor shapes in batch: {:?} vs {:?}",
                    tensor.shape(),
                    (h, w)
                )));
            }
            input.slice_mut(s![i, .., .., 0]).assign(&tensor.view());
        }
        let input_val = Value::from_array(input).map_err(|e: ort::Error| prediction_err(e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(vec![(
                self.input_name.clone(),
                SessionInputValue::from(input_val),
            )])
            .map_err(prediction_err)?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(prediction_err)?;

        let classes = shape.last().copied().unwrap_or(0).max(0) as usize;
        if classes == 0 || data.len() != classes * batch.len() {
            return Err(AudiotagError::Prediction(format!(
                "unexpected output shape {:?} for batch of {}",
                &shape[..],
                batch.len()
            )));
        }
        Ok(data.chunks(classes).map(<[f32]>::to_vec).collect())
    }
}

// ── OnnxVectorClassifier ────────────────────────────────────────────────────

/// Classifier over flat feature rows, e.g. an exported scikit-learn model.
///
/// Prefers an integer `label` output; falls back to the argmax of the first
/// float output.
pub struct OnnxVectorClassifier {
    session: Mutex<Session>,
    input_name: String,
    label_output: Option<String>,
}

impl OnnxVectorClassifier {
    pub fn load(path: &Path) -> Result<Self> {
        let session = open_reported("vector classifier", path)?;
        let input_name = first_input_name(&session)?;
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let label_output = resolve_name(&outputs, &["label", "output_label", "labels"]);
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            label_output,
        })
    }
}

impl VectorClassifier for OnnxVectorClassifier {
    fn predict(&self, rows: &[Vec<f32>]) -> Result<Vec<usize>> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let dim = first.len();
        if rows.iter().any(|r| r.len() != dim) {
            return Err(AudiotagError::Prediction("ragged feature rows".into()));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let input = Array2::from_shape_vec((rows.len(), dim), flat).map_err(prediction_err)?;
        let input_val = Value::from_array(input).map_err(|e: ort::Error| prediction_err(e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(vec![(
                self.input_name.clone(),
                SessionInputValue::from(input_val),
            )])
            .map_err(prediction_err)?;

        if let Some(label) = self.label_output.as_deref().and_then(|n| outputs.get(n)) {
            if let Ok((_, labels)) = label.try_extract_tensor::<i64>() {
                return Ok(labels.iter().map(|&l| l.max(0) as usize).collect());
            }
        }

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(prediction_err)?;
        let classes = shape.last().copied().unwrap_or(0).max(0) as usize;
        if classes == 0 || data.len() != classes * rows.len() {
            return Err(AudiotagError::Prediction(format!(
                "unexpected output shape {:?} for {} rows",
                &shape[..],
                rows.len()
            )));
        }
        Ok(data
            .chunks(classes)
            .map(|scores| argmax(scores).unwrap_or(0))
            .collect())
    }
}

// ── OnnxSeparator ───────────────────────────────────────────────────────────

/// Neural source separation producing `[1, stems, channels, frames]`.
pub struct OnnxSeparator {
    session: Mutex<Session>,
    input_name: String,
    /// Channel count the model was exported with, when fixed.
    model_channels: Option<usize>,
    stem: usize,
}

impl OnnxSeparator {
    pub fn load(path: &Path, stem: usize) -> Result<Self> {
        let session = open_reported("separator", path)?;
        let input_name = first_input_name(&session)?;
        let model_channels = session
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .filter(|shape| shape.len() >= 3)
            .map(|shape| shape[1])
            .filter(|&c| c > 0)
            .map(|c| c as usize);
        info!("    stem: {stem}, channels: {:?}", model_channels);
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            model_channels,
            stem,
        })
    }

    /// Planar input matched to the model's channel count.
    fn prepare(&self, audio: &DecodedAudio) -> Array3<f32> {
        let mut planar = audio.planar();
        if let Some(target) = self.model_channels {
            if planar.len() > target {
                let mono = audio.to_mono().samples;
                planar = vec![mono; target];
            } else {
                while planar.len() < target {
                    let copy = planar[0].clone();
                    planar.push(copy);
                }
            }
        }
        let frames = planar.first().map_or(0, Vec::len);
        Array3::from_shape_fn((1, planar.len(), frames), |(_, c, t)| planar[c][t])
    }
}

impl SourceSeparator for OnnxSeparator {
    fn separate(&self, audio: &DecodedAudio) -> Result<AudioSignal> {
        if audio.frames() == 0 {
            return Err(AudiotagError::InvalidAudio("nothing to separate".into()));
        }
        let input = self.prepare(audio);
        let input_val = Value::from_array(input).map_err(|e: ort::Error| prediction_err(e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(vec![(
                self.input_name.clone(),
                SessionInputValue::from(input_val),
            )])
            .map_err(prediction_err)?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(prediction_err)?;

        if shape.len() < 3 {
            return Err(AudiotagError::Prediction(format!(
                "separator output rank {} < 3",
                shape.len()
            )));
        }
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let frames = dims[dims.len() - 1];
        let channels = dims[dims.len() - 2].max(1);
        let stems = dims[dims.len() - 3];
        if self.stem >= stems {
            return Err(AudiotagError::Prediction(format!(
                "stem {} requested from {stems}-stem output",
                self.stem
            )));
        }
        let stem_len = channels * frames;
        let stem = data
            .get(self.stem * stem_len..(self.stem + 1) * stem_len)
            .ok_or_else(|| AudiotagError::Prediction("separator output truncated".into()))?;

        let mono: Vec<f32> = (0..frames)
            .map(|t| (0..channels).map(|c| stem[c * frames + t]).sum::<f32>() / channels as f32)
            .collect();
        debug!(frames, channels, stems, "separated stem");
        Ok(AudioSignal::new(mono, audio.sample_rate))
    }
}

// ── Registry loading ────────────────────────────────────────────────────────

/// Load every configured model from `paths`.
///
/// Never fails as a whole: a model that cannot be loaded is recorded in the
/// registry so only its task refuses requests. Identical paths share one
/// session.
pub fn load_registry(paths: &ModelPaths) -> ModelRegistry {
    info!("=== Audiotag ONNX Model Startup Report ===");
    info!("  model dir: {:?}", paths.dir);

    let mut builder = ModelRegistry::builder();
    let mut classifiers: HashMap<PathBuf, Arc<OnnxClassifier>> = HashMap::new();

    for key in [
        ModelKey::EmotionSpectrogram,
        ModelKey::EmotionMfcc,
        ModelKey::EmotionMel,
        ModelKey::Genre,
        ModelKey::Instrument,
    ] {
        let Some(path) = paths.path(key) else {
            builder = builder.failed(key, "not configured");
            continue;
        };
        if let Some(shared) = classifiers.get(&path) {
            builder = builder.classifier(key, shared.clone());
            continue;
        }
        match OnnxClassifier::load(&path) {
            Ok(model) => {
                let model = Arc::new(model);
                classifiers.insert(path, model.clone());
                builder = builder.classifier(key, model);
            }
            Err(e) => {
                warn!(model = %key, error = %e, "model failed to load");
                builder = builder.failed(key, e.to_string());
            }
        }
    }

    match paths.path(ModelKey::Gender).map(|p| OnnxVectorClassifier::load(&p)) {
        Some(Ok(model)) => builder = builder.vector_classifier(ModelKey::Gender, Arc::new(model)),
        Some(Err(e)) => {
            warn!(model = "gender", error = %e, "model failed to load");
            builder = builder.failed(ModelKey::Gender, e.to_string());
        }
        None => builder = builder.failed(ModelKey::Gender, "not configured"),
    }

    match paths
        .path(ModelKey::Separator)
        .map(|p| OnnxSeparator::load(&p, paths.separator_stem))
    {
        Some(Ok(model)) => builder = builder.separator(Arc::new(model)),
        Some(Err(e)) => {
            warn!(model = "separator", error = %e, "model failed to load");
            builder = builder.failed(ModelKey::Separator, e.to_string());
        }
        None => info!("  separator: disabled"),
    }

    let registry = builder.build();
    info!(
        failures = registry.failures().len(),
        "=== ONNX model loading complete ==="
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_recorded_not_fatal() {
        let paths = ModelPaths {
            dir: PathBuf::from("/nonexistent/audiotag-models"),
            ..ModelPaths::default()
        };
        let registry = load_registry(&paths);
        for key in ModelKey::ALL {
            assert!(!registry.is_loaded(key), "{key} should not load");
            assert!(registry.failures().contains_key(&key));
        }
        assert!(matches!(
            registry.classifier(ModelKey::Genre).err(),
            Some(AudiotagError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn resolve_name_is_case_insensitive() {
        let names = vec!["output_probability".to_string(), "Output_Label".to_string()];
        assert_eq!(
            resolve_name(&names, &["label", "output_label"]),
            Some("Output_Label".to_string())
        );
    }
}
