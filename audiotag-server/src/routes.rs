//! HTTP routes.
//!
//! | Method | Path                   | Body                | Query                               |
//! |--------|------------------------|---------------------|-------------------------------------|
//! | POST   | `/predict-emotion`     | `{"fileUrl": ...}`  |                                     |
//! | POST   | `/predict-gender[/]`   | `{"file_url": ...}` | `chunk_duration`, `overlap_duration` |
//! | POST   | `/predict-genre`       | `{"fileUrl": ...}`  |                                     |
//! | POST   | `/predict-instrument`  | `{"fileUrl": ...}`  |                                     |
//! | GET    | `/health`              |                     |                                     |
//!
//! Both URL spellings are accepted on every endpoint.

use std::collections::HashMap;
use std::convert::Infallible;

use audiotag_core::error::Result;
use audiotag_core::{AudiotagEngine, AudiotagError, DiagnosticsSnapshot, GenderParams, Task};
use serde::{Deserialize, Serialize};
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::reply::{handle_rejection, respond};

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct FileUrlBody {
    #[serde(default, alias = "fileUrl", alias = "file_url")]
    url: Option<String>,
}

/// Pulls the file URL out of a JSON body; anything unusable is a missing URL.
fn file_url(body: &[u8]) -> Result<String> {
    serde_json::from_slice::<FileUrlBody>(body)
        .ok()
        .and_then(|b| b.url)
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AudiotagError::InvalidRequest("No file URL provided.".into()))
}

/// Whole-second window overrides; absent keys keep the configured defaults.
fn gender_params(query: &HashMap<String, String>) -> Result<GenderParams> {
    let parse = |key: &str| -> Result<Option<u32>> {
        query
            .get(key)
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|_| {
                    AudiotagError::InvalidRequest(format!("{key} must be a non-negative integer"))
                })
            })
            .transpose()
    };
    Ok(GenderParams {
        chunk_duration: parse("chunk_duration")?,
        overlap_duration: parse("overlap_duration")?,
    })
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    tasks: HashMap<&'static str, bool>,
    diagnostics: DiagnosticsSnapshot,
}

pub fn routes(
    engine: AudiotagEngine,
    cors_origins: &[String],
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let body = warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes());

    let emotion = warp::path("predict-emotion")
        .and(warp::path::end())
        .and(warp::post())
        .and(body.clone())
        .and(with_engine(engine.clone()))
        .and_then(predict_emotion);

    let gender = warp::path("predict-gender")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<HashMap<String, String>>())
        .and(body.clone())
        .and(with_engine(engine.clone()))
        .and_then(predict_gender);

    let genre = warp::path("predict-genre")
        .and(warp::path::end())
        .and(warp::post())
        .and(body.clone())
        .and(with_engine(engine.clone()))
        .and_then(predict_genre);

    let instrument = warp::path("predict-instrument")
        .and(warp::path::end())
        .and(warp::post())
        .and(body)
        .and(with_engine(engine.clone()))
        .and_then(predict_instrument);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_engine(engine))
        .map(|engine: AudiotagEngine| {
            let tasks = Task::ALL
                .into_iter()
                .map(|t| (t.name(), engine.is_ready(t)))
                .collect();
            warp::reply::json(&Health {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
                tasks,
                diagnostics: engine.pipeline().diagnostics(),
            })
            .into_response()
        });

    emotion
        .or(gender)
        .unify()
        .or(genre)
        .unify()
        .or(instrument)
        .unify()
        .or(health)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(cors(cors_origins))
        .with(warp::trace::request())
        .map(Reply::into_response)
        .recover(handle_rejection)
        .unify()
}

fn cors(origins: &[String]) -> warp::cors::Builder {
    let builder = warp::cors()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type", "authorization", "accept"])
        .allow_credentials(true);
    if origins.iter().any(|o| o == "*") {
        builder.allow_any_origin()
    } else {
        builder.allow_origins(origins.iter().map(String::as_str))
    }
}

fn with_engine(
    engine: AudiotagEngine,
) -> impl Filter<Extract = (AudiotagEngine,), Error = Infallible> + Clone {
    warp::any().map(move || engine.clone())
}

async fn predict_emotion(body: Bytes, engine: AudiotagEngine) -> std::result::Result<Response, Rejection> {
    let outcome = match file_url(&body) {
        Ok(url) => engine.predict_emotion(&url).await,
        Err(e) => Err(e),
    };
    Ok(respond(Task::Emotion, outcome))
}

async fn predict_gender(
    query: HashMap<String, String>,
    body: Bytes,
    engine: AudiotagEngine,
) -> std::result::Result<Response, Rejection> {
    let outcome = match gender_params(&query).and_then(|params| Ok((params, file_url(&body)?))) {
        Ok((params, url)) => engine.predict_gender(&url, params).await,
        Err(e) => Err(e),
    };
    Ok(respond(Task::Gender, outcome))
}

async fn predict_genre(body: Bytes, engine: AudiotagEngine) -> std::result::Result<Response, Rejection> {
    let outcome = match file_url(&body) {
        Ok(url) => engine.predict_genre(&url).await,
        Err(e) => Err(e),
    };
    Ok(respond(Task::Genre, outcome))
}

async fn predict_instrument(body: Bytes, engine: AudiotagEngine) -> std::result::Result<Response, Rejection> {
    let outcome = match file_url(&body) {
        Ok(url) => engine.predict_instrument(&url).await,
        Err(e) => Err(e),
    };
    Ok(respond(Task::Instrument, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use audiotag_core::inference::stub::stub_registry;
    use audiotag_core::{EngineConfig, ModelRegistry, PipelineConfig};
    use warp::http::StatusCode;

    fn engine(registry: ModelRegistry) -> AudiotagEngine {
        let config = EngineConfig {
            pipeline: PipelineConfig {
                tie_break_seed: Some(1),
                extraction_workers: 1,
                ..PipelineConfig::default()
            },
            ..EngineConfig::default()
        };
        AudiotagEngine::new(config, Arc::new(registry)).unwrap()
    }

    fn api(registry: ModelRegistry) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
        routes(engine(registry), &["http://localhost:5173".to_string()])
    }

    fn detail_of(body: &[u8]) -> String {
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        json["detail"].as_str().unwrap().to_string()
    }

    #[test]
    fn file_url_accepts_both_spellings() {
        assert_eq!(file_url(br#"{"fileUrl": "http://a/b.mp3"}"#).unwrap(), "http://a/b.mp3");
        assert_eq!(file_url(br#"{"file_url": "http://a/b.mp3"}"#).unwrap(), "http://a/b.mp3");
        for bad in [&b""[..], b"{}", br#"{"fileUrl": "  "}"#, b"not json"] {
            assert!(matches!(file_url(bad), Err(AudiotagError::InvalidRequest(_))));
        }
    }

    #[test]
    fn gender_query_parsing() {
        let mut query = HashMap::new();
        assert_eq!(gender_params(&query).unwrap(), GenderParams::default());
        query.insert("chunk_duration".to_string(), "10".to_string());
        query.insert("overlap_duration".to_string(), "1".to_string());
        assert_eq!(
            gender_params(&query).unwrap(),
            GenderParams {
                chunk_duration: Some(10),
                overlap_duration: Some(1),
            }
        );
        query.insert("chunk_duration".to_string(), "-3".to_string());
        assert!(gender_params(&query).is_err());
    }

    #[tokio::test]
    async fn missing_url_is_400_with_detail() {
        let res = warp::test::request()
            .method("POST")
            .path("/predict-genre")
            .json(&serde_json::json!({}))
            .reply(&api(stub_registry()))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(detail_of(res.body()), "No file URL provided.");
    }

    #[tokio::test]
    async fn unreachable_download_status_per_task() {
        let api = api(stub_registry());

        let res = warp::test::request()
            .method("POST")
            .path("/predict-gender/")
            .json(&serde_json::json!({"file_url": "http://127.0.0.1:9/a.wav"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(detail_of(res.body()), "Error downloading file.");

        let res = warp::test::request()
            .method("POST")
            .path("/predict-emotion")
            .json(&serde_json::json!({"fileUrl": "http://127.0.0.1:9/a.wav"}))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!detail_of(res.body()).contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn invalid_gender_window_is_400() {
        let res = warp::test::request()
            .method("POST")
            .path("/predict-gender?chunk_duration=2&overlap_duration=5")
            .json(&serde_json::json!({"file_url": "http://127.0.0.1:9/a.wav"}))
            .reply(&api(stub_registry()))
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unloaded_model_is_503() {
        let res = warp::test::request()
            .method("POST")
            .path("/predict-instrument")
            .json(&serde_json::json!({"fileUrl": "http://127.0.0.1:9/a.wav"}))
            .reply(&api(ModelRegistry::default()))
            .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(detail_of(res.body()), "Model unavailable.");
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_method() {
        let api = api(stub_registry());
        let res = warp::test::request().path("/predict-tempo").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("GET")
            .path("/predict-genre")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reports_task_readiness() {
        let res = warp::test::request()
            .path("/health")
            .reply(&api(ModelRegistry::default()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(json["tasks"]["genre"], false);
        assert_eq!(json["diagnostics"]["requests"], 0);
        assert_eq!(json["diagnostics"]["inference_calls"], 0);
    }

    #[tokio::test]
    async fn cors_preflight_for_allowed_origin() {
        let res = warp::test::request()
            .method("OPTIONS")
            .path("/predict-genre")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .reply(&api(stub_registry()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
    }
}
