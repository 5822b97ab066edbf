//! Blocking prediction pipeline.
//!
//! ## Stages (per request)
//!
//! ```text
//! 1. Decode bytes → DecodedAudio (symphonia)
//! 2. Task-specific signal prep (mono, resample, peak-normalise, separate)
//! 3. Chunk → Vec<Chunk> (borrowed windows, no copies)
//! 4. Extract features per chunk (rayon fan-out, order preserved)
//! 5. One batched model call per model
//! 6. Aggregate → response payload
//! ```
//!
//! Everything here is synchronous and CPU-bound; callers run it inside
//! `spawn_blocking`. The only state shared between requests is the model
//! registry, the filterbank cache, the worker pool and the tie-break RNG.
//!
//! Every entry point takes a [`Cancellation`]. It is checked before each
//! chunk is extracted and before each model call, so a request the caller
//! has abandoned stops at the next boundary instead of queueing on a model
//! session.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, info_span, warn};

use crate::aggregate::{
    aggregate_genre, argmax, check_class_count, gender_vote, majority_vote, top_k, top_k_joined,
    GenreMode,
};
use crate::audio::{decode_bytes, AudioSignal, DecodedAudio};
use crate::chunking::{chunk_signal, whole_signal, Chunk};
use crate::engine::{GenderParams, PipelineConfig, Task};
use crate::error::{AudiotagError, Result};
use crate::features::{FeatureExtractor, FeatureSpec, FeatureTensor};
use crate::inference::{ModelKey, ModelRegistry};
use crate::labels::{mood_label, Gender, GENRES, INSTRUMENTS};
use crate::results::{EmotionPrediction, GenderPrediction, GenrePrediction, InstrumentPrediction};

/// Per-request abandon flag shared between the async caller and the
/// blocking job.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(AudiotagError::Other(anyhow::anyhow!(
                "request abandoned by caller"
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct PipelineDiagnostics {
    requests: AtomicUsize,
    failures: AtomicUsize,
    chunks_extracted: AtomicUsize,
    inference_calls: AtomicUsize,
}

impl PipelineDiagnostics {
    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            chunks_extracted: self.chunks_extracted.load(Ordering::Relaxed),
            inference_calls: self.inference_calls.load(Ordering::Relaxed),
        }
    }
}

/// Counters since process start, as reported by `/health` and the benchmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiagnosticsSnapshot {
    pub requests: usize,
    pub failures: usize,
    pub chunks_extracted: usize,
    pub inference_calls: usize,
}

pub struct PredictionPipeline {
    config: PipelineConfig,
    registry: Arc<ModelRegistry>,
    extractor: FeatureExtractor,
    workers: rayon::ThreadPool,
    rng: Mutex<StdRng>,
    diagnostics: PipelineDiagnostics,
}

impl PredictionPipeline {
    /// # Errors
    /// `InvalidRequest` if a configured window geometry is unusable.
    pub fn new(mut config: PipelineConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.normalize();
        config.validate()?;
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.extraction_workers)
            .thread_name(|i| format!("audiotag-extract-{i}"))
            .build()
            .map_err(|e| AudiotagError::Other(anyhow::anyhow!("extraction pool: {e}")))?;
        let rng = match config.tie_break_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            workers = config.extraction_workers,
            genre_mode = ?config.genre.mode,
            seeded = config.tie_break_seed.is_some(),
            "prediction pipeline configured"
        );
        Ok(Self {
            config,
            registry,
            extractor: FeatureExtractor::new(),
            workers,
            rng: Mutex::new(rng),
            diagnostics: PipelineDiagnostics::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// `ModelUnavailable` unless every model `task` needs is loaded.
    pub fn ensure_ready(&self, task: Task) -> Result<()> {
        self.registry.require(&task.required_models(&self.config))
    }

    // ── Emotion ─────────────────────────────────────────────────────────────

    pub fn predict_emotion(
        &self,
        bytes: &[u8],
        hint: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<EmotionPrediction> {
        self.observe(Task::Emotion, || {
            let signal = decode_nonempty(bytes, hint)?.to_mono();
            self.emotion_from_signal(signal, cancel)
        })
    }

    /// Three models score one representative window; their argmaxes vote.
    pub fn emotion_from_signal(
        &self,
        signal: AudioSignal,
        cancel: &Cancellation,
    ) -> Result<EmotionPrediction> {
        let cfg = &self.config.emotion;
        let signal = signal.resampled(cfg.target_sample_rate)?;

        let chunks = match &cfg.window {
            Some(window) => chunk_signal(&signal, window)?,
            None => whole_signal(&signal),
        };
        let chunk = chunks.first().ok_or_else(no_audio)?;
        self.diagnostics.chunks_extracted.fetch_add(1, Ordering::Relaxed);

        let mut votes = Vec::with_capacity(3);
        for (key, spec) in [
            (ModelKey::EmotionSpectrogram, &cfg.spectrogram),
            (ModelKey::EmotionMfcc, &cfg.mfcc),
            (ModelKey::EmotionMel, &cfg.mel),
        ] {
            cancel.check()?;
            let tensor = self
                .extractor
                .extract(chunk.samples, cfg.feature_sample_rate, spec)?;
            let scores = self.classify(key, &[tensor], cancel)?;
            let vote = scores
                .first()
                .and_then(|s| argmax(s))
                .ok_or_else(|| AudiotagError::Prediction(format!("{key} returned no scores")))?;
            debug!(model = %key, vote, "emotion vote");
            votes.push(vote);
        }

        let winner = majority_vote(&votes, &mut *self.rng.lock());
        Ok(EmotionPrediction {
            predicted_mood: mood_label(winner).to_string(),
        })
    }

    // ── Gender ──────────────────────────────────────────────────────────────

    pub fn predict_gender(
        &self,
        bytes: &[u8],
        hint: Option<&str>,
        params: GenderParams,
        cancel: &Cancellation,
    ) -> Result<GenderPrediction> {
        self.observe(Task::Gender, || {
            let signal = decode_nonempty(bytes, hint)?.to_mono();
            self.gender_from_signal(&signal, params, cancel)
        })
    }

    /// One mean-MFCC row per window; the binary labels vote.
    pub fn gender_from_signal(
        &self,
        signal: &AudioSignal,
        params: GenderParams,
        cancel: &Cancellation,
    ) -> Result<GenderPrediction> {
        let cfg = &self.config.gender;
        let model = self.registry.vector_classifier(ModelKey::Gender)?;
        let spec = cfg.chunk_spec(params);
        let chunks = chunk_signal(signal, &spec)?;
        if chunks.is_empty() {
            return Err(no_audio());
        }

        let rows: Vec<Vec<f32>> = self.workers.install(|| {
            chunks
                .par_iter()
                .map(|c| {
                    cancel.check()?;
                    self.extractor.mfcc_mean(c.samples, c.sample_rate, cfg.n_mfcc)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.diagnostics
            .chunks_extracted
            .fetch_add(rows.len(), Ordering::Relaxed);

        cancel.check()?;
        self.diagnostics.inference_calls.fetch_add(1, Ordering::Relaxed);
        let classes = model.predict(&rows)?;
        if classes.len() != rows.len() {
            return Err(AudiotagError::Prediction(format!(
                "gender model labelled {} of {} chunks",
                classes.len(),
                rows.len()
            )));
        }
        let votes: Vec<Gender> = classes.into_iter().map(Gender::from_class).collect();
        let gender = gender_vote(&votes);
        debug!(chunks = votes.len(), ?gender, "gender vote");
        Ok(GenderPrediction { gender })
    }

    // ── Genre ───────────────────────────────────────────────────────────────

    pub fn predict_genre(
        &self,
        bytes: &[u8],
        hint: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<GenrePrediction> {
        self.observe(Task::Genre, || {
            let signal = decode_nonempty(bytes, hint)?.to_mono();
            self.genre_from_signal(signal, cancel)
        })
    }

    pub fn genre_from_signal(&self, signal: AudioSignal, cancel: &Cancellation) -> Result<GenrePrediction> {
        let cfg = &self.config.genre;
        let signal = match cfg.mode {
            GenreMode::TemperatureSoftmax => signal.peak_normalized(),
            GenreMode::PlainMean => signal,
        };
        let chunks = chunk_signal(&signal, &cfg.chunking)?;
        let tensors = self.extract_all(&chunks, cfg.features(), cancel)?;
        let scores = self.classify(ModelKey::Genre, &tensors, cancel)?;
        check_class_count(&scores, &GENRES)?;

        let aggregated = aggregate_genre(&scores, cfg.mode, cfg.temperature)?;
        let (genre, top_genres) = top_k(&aggregated, &GENRES, cfg.top_k)?;
        debug!(%genre, ?top_genres, "genre ranking");
        Ok(GenrePrediction { genre, top_genres })
    }

    // ── Instrument ──────────────────────────────────────────────────────────

    pub fn predict_instrument(
        &self,
        bytes: &[u8],
        hint: Option<&str>,
        cancel: &Cancellation,
    ) -> Result<InstrumentPrediction> {
        self.observe(Task::Instrument, || {
            let decoded = decode_nonempty(bytes, hint)?;
            self.instrument_from_audio(decoded, cancel)
        })
    }

    /// Optional separation, then mean scores over capped windows.
    pub fn instrument_from_audio(
        &self,
        decoded: DecodedAudio,
        cancel: &Cancellation,
    ) -> Result<InstrumentPrediction> {
        let cfg = &self.config.instrument;
        let signal = if cfg.separate {
            let separator = self.registry.separator()?;
            cancel.check()?;
            let trimmed = decoded.truncated(cfg.max_separation_secs);
            let started = Instant::now();
            let stem = separator.separate(&trimmed)?;
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                samples = stem.samples.len(),
                "source separation finished"
            );
            stem
        } else {
            decoded.to_mono()
        };

        let chunks = chunk_signal(&signal, &cfg.chunking)?;
        let tensors = self.extract_all(&chunks, &cfg.features, cancel)?;
        let scores = self.classify(ModelKey::Instrument, &tensors, cancel)?;
        check_class_count(&scores, &INSTRUMENTS)?;

        let top_instruments = top_k_joined(&scores, &INSTRUMENTS, cfg.top_k)?;
        Ok(InstrumentPrediction { top_instruments })
    }

    // ── Shared stages ───────────────────────────────────────────────────────

    /// Features for every chunk on the worker pool, in chunk order.
    fn extract_all(
        &self,
        chunks: &[Chunk<'_>],
        spec: &FeatureSpec,
        cancel: &Cancellation,
    ) -> Result<Vec<FeatureTensor>> {
        if chunks.is_empty() {
            return Err(no_audio());
        }
        let tensors = self.workers.install(|| {
            chunks
                .par_iter()
                .map(|chunk| {
                    cancel.check()?;
                    self.extractor.extract_chunk(chunk, spec)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.diagnostics
            .chunks_extracted
            .fetch_add(tensors.len(), Ordering::Relaxed);
        Ok(tensors)
    }

    /// One batched call; exactly one score vector per tensor comes back.
    fn classify(
        &self,
        key: ModelKey,
        batch: &[FeatureTensor],
        cancel: &Cancellation,
    ) -> Result<Vec<Vec<f32>>> {
        let model = self.registry.classifier(key)?;
        cancel.check()?;
        self.diagnostics.inference_calls.fetch_add(1, Ordering::Relaxed);
        let scores = model.predict(batch)?;
        if scores.len() != batch.len() {
            return Err(AudiotagError::Prediction(format!(
                "{key} returned {} vectors for {} inputs",
                scores.len(),
                batch.len()
            )));
        }
        Ok(scores)
    }

    fn observe<T>(&self, task: Task, run: impl FnOnce() -> Result<T>) -> Result<T> {
        let span = info_span!("predict", task = task.name());
        let _guard = span.enter();
        let started = Instant::now();
        self.diagnostics.requests.fetch_add(1, Ordering::Relaxed);

        let result = run();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(elapsed_ms, "prediction complete"),
            Err(e) => {
                self.diagnostics.failures.fetch_add(1, Ordering::Relaxed);
                warn!(elapsed_ms, error = %e, "prediction failed");
            }
        }
        result
    }
}

fn decode_nonempty(bytes: &[u8], hint: Option<&str>) -> Result<DecodedAudio> {
    let decoded = decode_bytes(bytes, hint)?;
    if decoded.frames() == 0 {
        return Err(no_audio());
    }
    Ok(decoded)
}

fn no_audio() -> AudiotagError {
    AudiotagError::InvalidAudio("no audio samples to classify".into())
}
