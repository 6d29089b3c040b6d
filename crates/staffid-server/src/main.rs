use anyhow::{Context, Result};
use staffid_core::{EnrollmentService, GalleryStore, OnnxPipeline, RecognitionService};
use staffid_server::{create_router, spawn_engine, AppState, Config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(?config, "staffid-server starting");

    // Unreadable gallery or missing models are fatal at startup.
    let store = Arc::new(
        GalleryStore::open(&config.gallery_path)
            .with_context(|| format!("opening gallery {}", config.gallery_path.display()))?,
    );

    let encoders = (0..config.engine_workers)
        .map(|_| OnnxPipeline::load(&config.detector_model_path(), &config.recognizer_model_path()))
        .collect::<Result<Vec<_>, _>>()
        .context("loading ONNX models")?;
    tracing::info!(workers = encoders.len(), "models loaded");

    let enrollment = Arc::new(EnrollmentService::new(Arc::clone(&store), config.aggregation));
    let recognition = Arc::new(RecognitionService::new(Arc::clone(&store), config.match_policy()));
    let engine = spawn_engine(encoders, enrollment, recognition).context("starting engine")?;

    let state = Arc::new(AppState {
        engine,
        store,
        request_timeout: config.request_timeout(),
    });
    let app = create_router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "staffid-server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("staffid-server shutting down");
        })
        .await?;

    Ok(())
}
