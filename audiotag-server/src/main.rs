//! Audiotag HTTP service entry point.
//!
//! Startup order: logging, settings, model registry, engine, routes. Models
//! that fail to load do not stop the server; their tasks answer 503 until the
//! artifacts are fixed and the process restarted.

mod reply;
mod routes;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use audiotag_core::inference::stub::stub_registry;
use audiotag_core::{AudiotagEngine, ModelRegistry};
use settings::{default_settings_path, load_settings, ServerSettings};
use tracing::{info, warn};

fn build_registry(settings: &ServerSettings) -> ModelRegistry {
    if settings.stub_models {
        warn!("stub_models is enabled: every task is served by stand-in models");
        return stub_registry();
    }
    audiotag_core::load_registry(&settings.models)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "audiotag=info,audiotag_core=info,audiotag_server=info",
                )
            }),
        )
        .init();

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    info!(
        path = %settings_path.display(),
        bind_addr = %settings.bind_addr,
        models = %settings.models.dir.display(),
        "Audiotag starting"
    );

    // ONNX session creation is blocking and can take seconds per model.
    let registry = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || build_registry(&settings))
            .await
            .context("model loading task failed")?
    };
    for (key, reason) in registry.failures() {
        warn!(model = %key, %reason, "model unavailable");
    }

    let engine = AudiotagEngine::new(settings.engine_config(), Arc::new(registry))
        .context("engine initialisation failed")?;
    let api = routes::routes(engine, &settings.cors_origins);

    let addr = settings.bind_addr();
    let (bound, server) = warp::serve(api)
        .try_bind_with_graceful_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%bound, "listening");
    server.await;
    info!("Audiotag stopped");
    Ok(())
}
