#[cfg(not(feature = "onnx"))]
fn main() {
    eprintln!("audiotag benchmark requires the 'onnx' feature");
    std::process::exit(1);
}

#[cfg(feature = "onnx")]
fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "onnx")]
fn run() -> Result<(), String> {
    use audiotag_core::engine::PredictionPipeline;
    use audiotag_core::{
        load_registry, Cancellation, DiagnosticsSnapshot, GenderParams, ModelPaths, PipelineConfig,
        Task,
    };
    use serde::Serialize;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Instant;

    const AUDIO_EXTENSIONS: [&str; 6] = ["wav", "mp3", "flac", "ogg", "m4a", "aac"];

    #[derive(Debug)]
    struct Args {
        fixtures_dir: PathBuf,
        models_dir: Option<PathBuf>,
        task: Task,
        iterations: usize,
        seed: Option<u64>,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct CaseResult {
        file: String,
        iteration: usize,
        latency_ms: f64,
        label: Option<String>,
        error: Option<String>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        task: Task,
        fixtures_dir: String,
        iterations: usize,
        total_runs: usize,
        total_files: usize,
        p50_latency_ms: f64,
        p95_latency_ms: f64,
        avg_latency_ms: f64,
        error_rate: f64,
        labels: BTreeMap<String, usize>,
        diagnostics: DiagnosticsSnapshot,
        cases: Vec<CaseResult>,
    }

    fn parse_task(v: &str) -> Result<Task, String> {
        Task::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(v.trim()))
            .ok_or_else(|| format!("unknown task: {v} (emotion|gender|genre|instrument)"))
    }

    fn parse_args() -> Result<Args, String> {
        let mut fixtures_dir: Option<PathBuf> = None;
        let mut models_dir: Option<PathBuf> = None;
        let mut task = Task::Genre;
        let mut iterations: usize = 1;
        let mut seed: Option<u64> = None;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |name: &str| {
                it.next()
                    .ok_or_else(|| format!("missing value for {name}"))
            };
            match arg.as_str() {
                "--fixtures" => fixtures_dir = Some(PathBuf::from(value("--fixtures")?)),
                "--models" => models_dir = Some(PathBuf::from(value("--models")?)),
                "--task" => task = parse_task(&value("--task")?)?,
                "--iterations" => {
                    iterations = value("--iterations")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .clamp(1, 10);
                }
                "--seed" => {
                    seed = Some(
                        value("--seed")?
                            .parse::<u64>()
                            .map_err(|_| "invalid value for --seed".to_string())?,
                    );
                }
                "--output" => output = Some(PathBuf::from(value("--output")?)),
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p audiotag-core --features onnx --bin benchmark -- \\
  --fixtures <dir> [--task genre] [--models <dir>] [--iterations <n>] [--seed <n>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }

        Ok(Args {
            fixtures_dir: fixtures_dir.unwrap_or_else(|| PathBuf::from("benchmarks/fixtures")),
            models_dir,
            task,
            iterations,
            seed,
            output,
        })
    }

    fn collect_audio(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
        let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
        for entry in entries {
            let path = entry.map_err(|e| e.to_string())?.path();
            if path.is_dir() {
                collect_audio(&path, out)?;
                continue;
            }
            let is_audio = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| AUDIO_EXTENSIONS.iter().any(|e| s.eq_ignore_ascii_case(e)))
                .unwrap_or(false);
            if is_audio {
                out.push(path);
            }
        }
        Ok(())
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn classify(
        pipeline: &PredictionPipeline,
        task: Task,
        bytes: &[u8],
        hint: Option<&str>,
    ) -> audiotag_core::error::Result<String> {
        let cancel = Cancellation::new();
        Ok(match task {
            Task::Emotion => pipeline.predict_emotion(bytes, hint, &cancel)?.predicted_mood,
            Task::Gender => {
                let gender = pipeline
                    .predict_gender(bytes, hint, GenderParams::default(), &cancel)?
                    .gender;
                format!("{gender:?}")
            }
            Task::Genre => pipeline.predict_genre(bytes, hint, &cancel)?.genre,
            Task::Instrument => pipeline.predict_instrument(bytes, hint, &cancel)?.top_instruments,
        })
    }

    let args = parse_args()?;
    if !args.fixtures_dir.exists() {
        return Err(format!(
            "fixtures directory not found: {}",
            args.fixtures_dir.display()
        ));
    }

    let mut files = Vec::new();
    collect_audio(&args.fixtures_dir, &mut files)?;
    files.sort();
    if files.is_empty() {
        return Err(format!(
            "no audio fixtures found in {}",
            args.fixtures_dir.display()
        ));
    }

    let mut paths = ModelPaths::default();
    if let Some(dir) = &args.models_dir {
        paths.dir = dir.clone();
    }
    let registry = Arc::new(load_registry(&paths));
    let config = PipelineConfig {
        tie_break_seed: args.seed,
        ..PipelineConfig::default()
    };
    let pipeline = PredictionPipeline::new(config, registry).map_err(|e| e.to_string())?;
    pipeline.ensure_ready(args.task).map_err(|e| e.to_string())?;

    println!(
        "Running audiotag {} benchmark on {} fixtures (iterations={})",
        args.task.name(),
        files.len(),
        args.iterations
    );

    let mut cases = Vec::new();
    for path in &files {
        let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
        let hint = path.extension().and_then(|s| s.to_str());
        let file = path
            .strip_prefix(&args.fixtures_dir)
            .unwrap_or(path)
            .display()
            .to_string();

        for iteration in 1..=args.iterations {
            let started = Instant::now();
            let outcome = classify(&pipeline, args.task, &bytes, hint);
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            println!(
                "{file} [{iteration}/{iters}] {latency_ms:.1} ms",
                iters = args.iterations
            );
            let (label, error) = match outcome {
                Ok(label) => (Some(label), None),
                Err(e) => (None, Some(e.to_string())),
            };
            cases.push(CaseResult {
                file: file.clone(),
                iteration,
                latency_ms,
                label,
                error,
            });
        }
    }

    let mut labels: BTreeMap<String, usize> = BTreeMap::new();
    for label in cases.iter().filter_map(|c| c.label.as_ref()) {
        *labels.entry(label.clone()).or_default() += 1;
    }
    let latencies = cases.iter().map(|c| c.latency_ms).collect::<Vec<_>>();
    let errors = cases.iter().filter(|c| c.error.is_some()).count();
    let summary = Summary {
        task: args.task,
        fixtures_dir: args.fixtures_dir.display().to_string(),
        iterations: args.iterations,
        total_runs: cases.len(),
        total_files: files.len(),
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        avg_latency_ms: latencies.iter().sum::<f64>() / latencies.len().max(1) as f64,
        error_rate: errors as f64 / cases.len().max(1) as f64,
        labels,
        diagnostics: pipeline.diagnostics(),
        cases,
    };

    println!(
        "Done. runs={} p50={:.1}ms p95={:.1}ms error_rate={:.1}% inference_calls={}",
        summary.total_runs,
        summary.p50_latency_ms,
        summary.p95_latency_ms,
        summary.error_rate * 100.0,
        summary.diagnostics.inference_calls
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
