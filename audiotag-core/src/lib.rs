//! # audiotag-core
//!
//! Music classification engine: vocalist gender, mood, genre and instruments
//! from a downloaded audio file.
//!
//! ## Architecture
//!
//! ```text
//! URL → Fetcher (reqwest) → bytes → spawn_blocking(PredictionPipeline)
//!                                          │
//!                                decode (symphonia) → mono / resample / separate
//!                                          │
//!                                chunk_signal → Vec<Chunk>
//!                                          │
//!                          FeatureExtractor (rayon fan-out, one tensor per chunk)
//!                                          │
//!                          Classifier::predict (one batch per model)
//!                                          │
//!                                aggregate → *Prediction
//! ```
//!
//! Transports only ever see [`AudiotagEngine`] and the typed
//! [`AudiotagError`]; status-code translation happens at the edge.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod audio;
pub mod chunking;
pub mod engine;
pub mod error;
pub mod features;
pub mod fetch;
pub mod inference;
pub mod labels;
pub mod results;
pub mod separation;

// Convenience re-exports for downstream crates
pub use aggregate::GenreMode;
pub use engine::{
    AudiotagEngine, Cancellation, DiagnosticsSnapshot, EngineConfig, GenderParams, PipelineConfig,
    Task,
};
pub use error::{AudiotagError, ErrorKind};
pub use inference::{Classifier, ModelKey, ModelPaths, ModelRegistry, VectorClassifier};
pub use labels::Gender;
pub use results::{EmotionPrediction, GenderPrediction, GenrePrediction, InstrumentPrediction};
pub use separation::SourceSeparator;

#[cfg(feature = "onnx")]
pub use inference::load_registry;
