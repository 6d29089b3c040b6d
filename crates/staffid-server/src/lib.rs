//! StaffID HTTP server.
//!
//! Thin axum layer over the model worker pool and the shared gallery.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use staffid_core::GalleryStore;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod engine;
pub mod routes;

pub use config::Config;
pub use engine::{spawn_engine, EngineError, EngineHandle};

/// Application state shared across handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Arc<GalleryStore>,
    pub request_timeout: Duration,
}

/// Build the application router.
pub fn create_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(routes::status))
        .route("/staff", get(routes::list_staff))
        .route("/enroll", post(routes::enroll))
        .route("/recognize", post(routes::recognize))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
