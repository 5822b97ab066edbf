use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audiotag_core::engine::PredictionPipeline;
use audiotag_core::inference::stub::{stub_registry, StubClassifier, StubVectorClassifier};
use audiotag_core::labels::{GENRES, INSTRUMENTS};
use audiotag_core::separation::PassthroughSeparator;
use audiotag_core::{
    AudiotagEngine, AudiotagError, Cancellation, EngineConfig, Gender, GenderParams, ModelKey,
    ModelRegistry, PipelineConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn wav_bytes(seconds: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * sample_rate as f32) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.4
                + (2.0 * std::f32::consts::PI * 97.0 * t).sin() * 0.2;
            for _ in 0..channels {
                writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        tie_break_seed: Some(11),
        extraction_workers: 2,
        ..PipelineConfig::default()
    }
}

/// Serves `body` with `status` to every connection until the test ends.
async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
    serve(status, body, true).await
}

/// Like [`serve_once`]; without `declare_length` the body runs until the
/// connection closes.
async fn serve(status: &'static str, body: Vec<u8>, declare_length: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let length = if declare_length {
                    format!("Content-Length: {}\r\n", body.len())
                } else {
                    String::new()
                };
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: audio/wav\r\n{length}Connection: close\r\n\r\n"
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/song.wav")
}

#[test]
fn genre_batches_every_window_of_a_45s_track() {
    let model = Arc::new(
        StubClassifier::fixed((0..GENRES.len()).map(|i| i as f32).collect())
            .expecting_shape((128, 128)),
    );
    let registry = ModelRegistry::builder()
        .classifier(ModelKey::Genre, model.clone())
        .build();
    let pipeline = PredictionPipeline::new(config(), Arc::new(registry)).unwrap();

    let out = pipeline
        .predict_genre(&wav_bytes(45.0, 22_050, 1), Some("wav"), &Cancellation::new())
        .unwrap();

    assert_eq!(model.batch_sizes(), vec![22]);
    assert_eq!(out.genre, "Rock");
    assert_eq!(out.top_genres.len(), 3);
    assert_eq!(out.top_genres[1].0, "Reggae");
    assert!(out.top_genres[0].1 > out.top_genres[1].1);
}

#[test]
fn instrument_reads_stereo_and_caps_windows() {
    let model = Arc::new(
        StubClassifier::fixed((0..INSTRUMENTS.len()).map(|i| -(i as f32)).collect())
            .expecting_shape((128, 128)),
    );
    let registry = ModelRegistry::builder()
        .classifier(ModelKey::Instrument, model.clone())
        .separator(Arc::new(PassthroughSeparator))
        .build();
    let pipeline = PredictionPipeline::new(config(), Arc::new(registry)).unwrap();

    let out = pipeline
        .predict_instrument(&wav_bytes(30.0, 8_000, 2), Some("wav"), &Cancellation::new())
        .unwrap();

    assert_eq!(model.tensors_seen(), 5);
    assert_eq!(
        out.top_instruments,
        "Accordion, Acoustic Guitar, Banjo, Bass Guitar, Clarinet, Cowbell"
    );
}

#[test]
fn gender_tie_across_chunks_reports_female() {
    let calls = AtomicUsize::new(0);
    let registry = ModelRegistry::builder()
        .vector_classifier(
            ModelKey::Gender,
            Arc::new(StubVectorClassifier::from_fn(move |_| {
                calls.fetch_add(1, Ordering::SeqCst) % 2
            })),
        )
        .build();
    let pipeline = PredictionPipeline::new(config(), Arc::new(registry)).unwrap();
    let params = GenderParams {
        chunk_duration: Some(2),
        overlap_duration: Some(0),
    };

    let out = pipeline
        .predict_gender(&wav_bytes(8.0, 8_000, 1), Some("wav"), params, &Cancellation::new())
        .unwrap();
    assert_eq!(out.gender, Gender::Female);
}

#[test]
fn emotion_vote_over_a_decoded_track() {
    let pipeline = PredictionPipeline::new(config(), Arc::new(stub_registry())).unwrap();
    let out = pipeline
        .predict_emotion(&wav_bytes(3.0, 44_100, 2), Some("wav"), &Cancellation::new())
        .unwrap();
    // Every stub model ranks the first mood highest.
    assert_eq!(out.predicted_mood, "Angry");
    assert_eq!(pipeline.diagnostics().inference_calls, 3);
}

#[test]
fn garbage_bytes_are_a_decode_error() {
    let pipeline = PredictionPipeline::new(config(), Arc::new(stub_registry())).unwrap();
    let err = pipeline
        .predict_genre(b"definitely not audio", Some("mp3"), &Cancellation::new())
        .unwrap_err();
    assert!(matches!(err, AudiotagError::Decode(_)));
}

#[tokio::test]
async fn engine_downloads_and_classifies() {
    let url = serve_once("200 OK", wav_bytes(10.0, 8_000, 1)).await;
    let engine = AudiotagEngine::new(
        EngineConfig {
            pipeline: config(),
            ..EngineConfig::default()
        },
        Arc::new(stub_registry()),
    )
    .unwrap();

    let genre = engine.predict_genre(&url).await.unwrap();
    assert_eq!(genre.genre, GENRES[0]);

    let gender = engine.predict_gender(&url, GenderParams::default()).await.unwrap();
    assert_eq!(gender.gender, Gender::Female);
}

#[tokio::test]
async fn missing_remote_file_is_download_error() {
    let url = serve_once("404 Not Found", Vec::new()).await;
    let engine = AudiotagEngine::new(EngineConfig::default(), Arc::new(stub_registry())).unwrap();
    let err = engine.predict_instrument(&url).await.unwrap_err();
    assert!(matches!(err, AudiotagError::Download(_)));
}

#[tokio::test]
async fn request_deadline_maps_to_timeout() {
    // Accepts the connection and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let engine = AudiotagEngine::new(
        EngineConfig {
            request_timeout: Duration::from_millis(200),
            download_timeout: Duration::from_secs(30),
            ..EngineConfig::default()
        },
        Arc::new(stub_registry()),
    )
    .unwrap();
    let err = engine
        .predict_emotion(&format!("http://{addr}/slow.wav"))
        .await
        .unwrap_err();
    assert!(matches!(err, AudiotagError::Timeout(_)));
}

fn capped_engine(max_download_bytes: u64) -> AudiotagEngine {
    AudiotagEngine::new(
        EngineConfig {
            pipeline: config(),
            max_download_bytes,
            ..EngineConfig::default()
        },
        Arc::new(stub_registry()),
    )
    .unwrap()
}

#[tokio::test]
async fn declared_oversized_body_is_refused() {
    let track = wav_bytes(10.0, 8_000, 1);
    let url = serve_once("200 OK", track.clone()).await;

    let err = capped_engine(track.len() as u64 - 1)
        .predict_genre(&url)
        .await
        .unwrap_err();
    assert!(matches!(err, AudiotagError::Download(_)));

    let genre = capped_engine(track.len() as u64)
        .predict_genre(&url)
        .await
        .unwrap();
    assert_eq!(genre.genre, GENRES[0]);
}

#[tokio::test]
async fn undeclared_body_is_cut_off_at_the_cap() {
    let track = wav_bytes(10.0, 8_000, 1);
    let url = serve("200 OK", track.clone(), false).await;

    let err = capped_engine(64 * 1024).predict_genre(&url).await.unwrap_err();
    assert!(matches!(err, AudiotagError::Download(_)));

    let genre = capped_engine(track.len() as u64)
        .predict_genre(&url)
        .await
        .unwrap();
    assert_eq!(genre.genre, GENRES[0]);
}
