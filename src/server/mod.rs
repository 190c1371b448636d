//! HTTP front-end for the map service.
//!
//! # Endpoints
//!
//! - `POST /job` — create and start a job (201 + description)
//! - `GET /job/{id}` — job description (200, or 404)
//! - `PUT /job/{id}/input` — admit a batch of inputs (201, 400 on state
//!   error, 404 unknown)
//! - `POST /job/{id}/complete` — close the input set (200, 400, 404)
//! - `GET /job/{id}/output` — block on completion, then return all
//!   successful results (200, 417 when the job did not complete)
//! - `DELETE /job/{id}` — tear the job down and remove its stored results
//! - `GET /health` — liveness probe

use std::path::PathBuf;
use std::sync::Arc;

pub mod health;
pub mod jobs;

pub use health::health_handler;
pub use jobs::{
    add_inputs_handler, complete_job_handler, create_job_handler, delete_job_handler,
    get_job_handler, get_outputs_handler,
};

use crate::registry::JobRegistry;

/// Shared application state, passed to all handlers via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// All live jobs, keyed by ID.
    registry: JobRegistry,

    /// Shared secret every job sends to its backend.
    secret: String,

    /// Root directory for per-job result stores.
    db_path: PathBuf,
}

impl AppState {
    /// Creates a new `AppState` with an empty job registry.
    pub fn new(secret: impl Into<String>, db_path: impl Into<PathBuf>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                registry: JobRegistry::new(),
                secret: secret.into(),
                db_path: db_path.into(),
            }),
        }
    }

    /// Returns the job registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Returns the shared backend secret.
    pub fn secret(&self) -> &str {
        &self.inner.secret
    }

    /// Returns the result-store root directory.
    pub fn db_path(&self) -> &PathBuf {
        &self.inner.db_path
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post, put};

    axum::Router::new()
        .route("/job", post(create_job_handler))
        .route("/job/{id}", get(get_job_handler).delete(delete_job_handler))
        .route("/job/{id}/input", put(add_inputs_handler))
        .route("/job/{id}/complete", post(complete_job_handler))
        .route("/job/{id}/output", get(get_outputs_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
