//! ydm-ingest library interface
//!
//! The asynchronous YOLO dataset import pipeline: capability gateways, the
//! import components, the worker pool and a thin HTTP surface.

pub mod api;
pub mod db;
pub mod error;
pub mod gateways;
pub mod services;
pub mod utils;
pub mod worker;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

use crate::services::ImportService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: ImportService,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: ImportService) -> Self {
        Self {
            service,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::import_routes())
        .merge(api::dataset_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
