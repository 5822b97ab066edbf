//! `AudiotagEngine`: the async front door used by transports.
//!
//! ## Request lifecycle
//!
//! ```text
//! predict_*(url)
//!     ├─► registry check      → ModelUnavailable before any network I/O
//!     ├─► URL check           → InvalidRequest on an empty URL
//!     └─► timeout(request_timeout) {
//!             download (reqwest, own download_timeout, max_download_bytes)
//!             └─► spawn_blocking(PredictionPipeline::predict_*)
//!         }                   → Timeout once the deadline passes
//! ```
//!
//! The blocking pipeline runs off the async executor so one slow inference
//! never stalls other requests. No retries anywhere: the first failure fails
//! the request.

pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use pipeline::{Cancellation, DiagnosticsSnapshot, PredictionPipeline};

use crate::aggregate::GenreMode;
use crate::audio::decode::extension_from_url;
use crate::chunking::{ChunkSpec, TailPolicy};
use crate::error::{AudiotagError, Result};
use crate::features::{DbScale, FeatureKind, FeatureSpec, MelOptions, ResizeMode};
use crate::fetch::{validate_url, Fetcher};
use crate::inference::{ModelKey, ModelRegistry};
use crate::results::{EmotionPrediction, GenderPrediction, GenrePrediction, InstrumentPrediction};
use crate::separation::MAX_SEPARATION_SECS;

/// The four classification tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Emotion,
    Gender,
    Genre,
    Instrument,
}

impl Task {
    pub const ALL: [Task; 4] = [Task::Emotion, Task::Gender, Task::Genre, Task::Instrument];

    pub fn name(self) -> &'static str {
        match self {
            Task::Emotion => "emotion",
            Task::Gender => "gender",
            Task::Genre => "genre",
            Task::Instrument => "instrument",
        }
    }

    /// Models that must be loaded before this task may serve a request.
    pub fn required_models(self, config: &PipelineConfig) -> Vec<ModelKey> {
        match self {
            Task::Emotion => vec![
                ModelKey::EmotionSpectrogram,
                ModelKey::EmotionMfcc,
                ModelKey::EmotionMel,
            ],
            Task::Gender => vec![ModelKey::Gender],
            Task::Genre => vec![ModelKey::Genre],
            Task::Instrument if config.instrument.separate => {
                vec![ModelKey::Instrument, ModelKey::Separator]
            }
            Task::Instrument => vec![ModelKey::Instrument],
        }
    }
}

// ── Pipeline configuration ──────────────────────────────────────────────────

/// Emotion: three CNNs over one representative window, majority vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionConfig {
    /// Rate the decoded audio is resampled to.
    pub target_sample_rate: u32,
    /// Rate declared to the feature extractor. The models were trained with
    /// features computed as if the 11 025 Hz signal were at 22 050 Hz.
    pub feature_sample_rate: u32,
    /// Optional window for the representative chunk; `None` uses the whole signal.
    pub window: Option<ChunkSpec>,
    pub spectrogram: FeatureSpec,
    pub mfcc: FeatureSpec,
    pub mel: FeatureSpec,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 11_025,
            feature_sample_rate: 22_050,
            window: None,
            spectrogram: FeatureSpec::new(FeatureKind::SpectrogramDb, (300, 300), ResizeMode::Tile),
            mfcc: FeatureSpec::new(FeatureKind::Mfcc { n_mfcc: 20 }, (120, 600), ResizeMode::Tile),
            mel: FeatureSpec::new(
                FeatureKind::MelDb(MelOptions {
                    n_mels: 128,
                    fmax: None,
                    db: DbScale::Amplitude,
                    standardize: false,
                }),
                (300, 400),
                ResizeMode::Tile,
            ),
        }
    }
}

/// Gender: mean-MFCC vectors per window, chunk vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenderConfig {
    pub default_chunk_duration_s: u32,
    pub default_overlap_duration_s: u32,
    pub n_mfcc: usize,
}

impl Default for GenderConfig {
    fn default() -> Self {
        Self {
            default_chunk_duration_s: 30,
            default_overlap_duration_s: 2,
            n_mfcc: 128,
        }
    }
}

/// Per-request overrides for the gender windowing, in whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenderParams {
    pub chunk_duration: Option<u32>,
    pub overlap_duration: Option<u32>,
}

impl GenderConfig {
    /// Window spec for one request: stride windows from 0, short tail windows kept.
    pub fn chunk_spec(&self, params: GenderParams) -> ChunkSpec {
        let chunk = params.chunk_duration.unwrap_or(self.default_chunk_duration_s);
        let overlap = params.overlap_duration.unwrap_or(self.default_overlap_duration_s);
        ChunkSpec::new(chunk as f32, overlap as f32).with_tail(TailPolicy::Truncate)
    }
}

/// Genre: one CNN over 4 s windows, softmax-averaged or plain-averaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenreConfig {
    pub mode: GenreMode,
    pub temperature: f32,
    pub top_k: usize,
    pub chunking: ChunkSpec,
    /// Features for [`GenreMode::TemperatureSoftmax`]; the signal is also
    /// peak-normalised in this mode.
    pub softmax_features: FeatureSpec,
    /// Features for [`GenreMode::PlainMean`].
    pub plain_features: FeatureSpec,
}

impl Default for GenreConfig {
    fn default() -> Self {
        Self {
            mode: GenreMode::TemperatureSoftmax,
            temperature: 1.5,
            top_k: 3,
            chunking: ChunkSpec::new(4.0, 2.0),
            softmax_features: FeatureSpec::new(
                FeatureKind::MelDb(MelOptions {
                    n_mels: 128,
                    fmax: Some(8_000.0),
                    db: DbScale::Power,
                    standardize: true,
                }),
                (128, 128),
                ResizeMode::Tile,
            ),
            plain_features: FeatureSpec::new(
                FeatureKind::MelDb(MelOptions::power_db(128)),
                (128, 128),
                ResizeMode::Tile,
            ),
        }
    }
}

impl GenreConfig {
    pub fn features(&self) -> &FeatureSpec {
        match self.mode {
            GenreMode::TemperatureSoftmax => &self.softmax_features,
            GenreMode::PlainMean => &self.plain_features,
        }
    }
}

/// Instrument: optional separation, capped 4 s windows, mean scores, top six.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub separate: bool,
    pub max_separation_secs: f32,
    pub chunking: ChunkSpec,
    pub features: FeatureSpec,
    pub top_k: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            separate: true,
            max_separation_secs: MAX_SEPARATION_SECS,
            chunking: ChunkSpec::new(4.0, 2.0).with_max_chunks(5),
            features: FeatureSpec::new(
                FeatureKind::MelDb(MelOptions::power_db(128)),
                (128, 128),
                ResizeMode::Bilinear,
            ),
            top_k: 6,
        }
    }
}

/// Everything the blocking pipeline needs to know about each task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub emotion: EmotionConfig,
    pub gender: GenderConfig,
    pub genre: GenreConfig,
    pub instrument: InstrumentConfig,
    /// Seed for the emotion tie-break; `None` seeds from OS entropy.
    pub tie_break_seed: Option<u64>,
    /// Threads for parallel per-chunk feature extraction.
    pub extraction_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            emotion: EmotionConfig::default(),
            gender: GenderConfig::default(),
            genre: GenreConfig::default(),
            instrument: InstrumentConfig::default(),
            tie_break_seed: None,
            extraction_workers: default_extraction_workers(),
        }
    }
}

pub fn default_extraction_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8)
}

impl PipelineConfig {
    /// Clamp numeric fields into their working ranges.
    pub fn normalize(&mut self) {
        self.extraction_workers = self.extraction_workers.clamp(1, 32);
        if !self.genre.temperature.is_finite() || self.genre.temperature <= 0.0 {
            self.genre.temperature = 1.5;
        }
        self.genre.top_k = self.genre.top_k.max(1);
        self.instrument.top_k = self.instrument.top_k.max(1);
        let max_secs = self.instrument.max_separation_secs;
        if !max_secs.is_finite() || max_secs <= 0.0 {
            self.instrument.max_separation_secs = MAX_SEPARATION_SECS;
        }
        self.emotion.target_sample_rate = self.emotion.target_sample_rate.max(1);
        self.emotion.feature_sample_rate = self.emotion.feature_sample_rate.max(1);
        self.gender.n_mfcc = self.gender.n_mfcc.max(1);
    }

    /// Reject window geometries that could never produce a chunk.
    pub fn validate(&self) -> Result<()> {
        let probe_rate = 22_050;
        self.genre.chunking.geometry(probe_rate)?;
        self.instrument.chunking.geometry(probe_rate)?;
        self.gender.chunk_spec(GenderParams::default()).geometry(probe_rate)?;
        if let Some(window) = &self.emotion.window {
            window.geometry(probe_rate)?;
        }
        Ok(())
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Configuration for [`AudiotagEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    /// Deadline for a whole request: download plus inference. Default: 120 s.
    pub request_timeout: Duration,
    /// Deadline for the download alone. Default: 30 s.
    pub download_timeout: Duration,
    /// Largest response body accepted from the file URL. Default: 100 MiB.
    pub max_download_bytes: u64,
}

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            request_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(30),
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        }
    }
}

/// Cheap to clone; wrap in `Arc` or clone freely into transport handlers.
#[derive(Clone)]
pub struct AudiotagEngine {
    pipeline: Arc<PredictionPipeline>,
    fetcher: Fetcher,
    request_timeout: Duration,
}

impl AudiotagEngine {
    pub fn new(config: EngineConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        let pipeline = PredictionPipeline::new(config.pipeline, registry)?;
        let fetcher = Fetcher::new(config.download_timeout, config.max_download_bytes)?;
        for task in Task::ALL {
            match pipeline.ensure_ready(task) {
                Ok(()) => info!(task = task.name(), "task ready"),
                Err(e) => warn!(task = task.name(), error = %e, "task will refuse requests"),
            }
        }
        Ok(Self {
            pipeline: Arc::new(pipeline),
            fetcher,
            request_timeout: config.request_timeout,
        })
    }

    pub fn pipeline(&self) -> &Arc<PredictionPipeline> {
        &self.pipeline
    }

    pub fn is_ready(&self, task: Task) -> bool {
        self.pipeline.ensure_ready(task).is_ok()
    }

    pub async fn predict_emotion(&self, url: &str) -> Result<EmotionPrediction> {
        self.run(Task::Emotion, url, |p, bytes, hint, cancel| {
            p.predict_emotion(bytes, hint, cancel)
        })
            .await
    }

    pub async fn predict_gender(&self, url: &str, params: GenderParams) -> Result<GenderPrediction> {
        // Reject bad window parameters before downloading anything.
        self.pipeline
            .config()
            .gender
            .chunk_spec(params)
            .geometry(1)?;
        self.run(Task::Gender, url, move |p, bytes, hint, cancel| {
            p.predict_gender(bytes, hint, params, cancel)
        })
        .await
    }

    pub async fn predict_genre(&self, url: &str) -> Result<GenrePrediction> {
        self.run(Task::Genre, url, |p, bytes, hint, cancel| {
            p.predict_genre(bytes, hint, cancel)
        })
            .await
    }

    pub async fn predict_instrument(&self, url: &str) -> Result<InstrumentPrediction> {
        self.run(Task::Instrument, url, |p, bytes, hint, cancel| {
            p.predict_instrument(bytes, hint, cancel)
        })
        .await
    }

    /// Download, then classify on the blocking pool, all under the request
    /// deadline. When the deadline fires the blocking job cannot be aborted;
    /// it is flagged instead and stops at its next chunk or model boundary.
    async fn run<T, F>(&self, task: Task, url: &str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PredictionPipeline, &[u8], Option<&str>, &Cancellation) -> Result<T>
            + Send
            + 'static,
    {
        self.pipeline.ensure_ready(task)?;
        let url = validate_url(url)?;
        let deadline = self.request_timeout;
        let pipeline = Arc::clone(&self.pipeline);
        let fetcher = self.fetcher.clone();
        let cancel = Cancellation::new();
        let job_cancel = cancel.clone();

        let work = async move {
            let bytes = fetcher.fetch(&url).await?;
            let hint = extension_from_url(&url).map(str::to_owned);
            tokio::task::spawn_blocking(move || {
                job(&pipeline, &bytes, hint.as_deref(), &job_cancel)
            })
                .await
                .map_err(|e| {
                    AudiotagError::Other(anyhow::anyhow!("pipeline task died unexpectedly: {e}"))
                })?
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                warn!(task = task.name(), ?deadline, "request deadline exceeded");
                Err(AudiotagError::Timeout(deadline))
            }
        }
    }
}

impl std::fmt::Debug for AudiotagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudiotagEngine")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::stub_registry;

    #[test]
    fn instrument_needs_separator_only_when_enabled() {
        let mut config = PipelineConfig::default();
        assert!(Task::Instrument
            .required_models(&config)
            .contains(&ModelKey::Separator));
        config.instrument.separate = false;
        assert_eq!(
            Task::Instrument.required_models(&config),
            vec![ModelKey::Instrument]
        );
    }

    #[test]
    fn gender_spec_uses_query_overrides() {
        let config = GenderConfig::default();
        let spec = config.chunk_spec(GenderParams::default());
        assert_eq!(spec.chunk_duration_s, 30.0);
        assert_eq!(spec.overlap_duration_s, 2.0);
        assert_eq!(spec.tail, TailPolicy::Truncate);
        let spec = config.chunk_spec(GenderParams {
            chunk_duration: Some(10),
            overlap_duration: None,
        });
        assert_eq!(spec.chunk_duration_s, 10.0);
    }

    #[test]
    fn normalize_repairs_out_of_range_values() {
        let mut config = PipelineConfig {
            extraction_workers: 0,
            ..PipelineConfig::default()
        };
        config.genre.temperature = -1.0;
        config.instrument.top_k = 0;
        config.normalize();
        assert_eq!(config.extraction_workers, 1);
        assert_eq!(config.genre.temperature, 1.5);
        assert_eq!(config.instrument.top_k, 1);
    }

    #[test]
    fn genre_mode_selects_feature_spec() {
        let mut config = GenreConfig::default();
        assert!(matches!(
            config.features().kind,
            FeatureKind::MelDb(MelOptions { standardize: true, .. })
        ));
        config.mode = GenreMode::PlainMean;
        assert!(matches!(
            config.features().kind,
            FeatureKind::MelDb(MelOptions { standardize: false, fmax: None, .. })
        ));
    }

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"genre": {"mode": "plain_mean"}, "tie_break_seed": 5}"#)
                .unwrap();
        assert_eq!(config.genre.mode, GenreMode::PlainMean);
        assert_eq!(config.genre.top_k, 3);
        assert_eq!(config.tie_break_seed, Some(5));
        assert_eq!(config.instrument.chunking.max_chunks, Some(5));
    }

    #[tokio::test]
    async fn empty_url_is_invalid_request() {
        let engine = AudiotagEngine::new(EngineConfig::default(), Arc::new(stub_registry())).unwrap();
        let err = engine.predict_genre("   ").await.unwrap_err();
        assert!(matches!(err, AudiotagError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unavailable_task_refuses_before_download() {
        let engine =
            AudiotagEngine::new(EngineConfig::default(), Arc::new(ModelRegistry::default())).unwrap();
        assert!(!engine.is_ready(Task::Genre));
        let err = engine
            .predict_genre("http://127.0.0.1:9/never-fetched.wav")
            .await
            .unwrap_err();
        assert!(matches!(err, AudiotagError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn bad_gender_window_is_invalid_request() {
        let engine = AudiotagEngine::new(EngineConfig::default(), Arc::new(stub_registry())).unwrap();
        let err = engine
            .predict_gender(
                "http://127.0.0.1:9/x.wav",
                GenderParams {
                    chunk_duration: Some(2),
                    overlap_duration: Some(2),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AudiotagError::InvalidRequest(_)));
    }
}
