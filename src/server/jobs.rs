//! Job management endpoints.
//!
//! These handlers translate between the REST surface and the job engine:
//! JSON values arriving as input values are re-serialized to bytes before
//! admission, and stored result bytes are re-parsed as JSON on the way out.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::job::state::JobState;
use crate::job::{Job, JobConfig, JobDescription, JobError};
use crate::types::JobId;

use super::AppState;

/// Errors produced by the job endpoints.
#[derive(Debug, Error)]
pub enum JobApiError {
    /// No job registered under the requested ID.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The request itself is malformed (bad URL, bad JSON value).
    #[error("{0}")]
    BadRequest(String),

    /// Engine-level failure, mapped by kind.
    #[error(transparent)]
    Job(#[from] JobError),
}

impl IntoResponse for JobApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            JobApiError::NotFound(_) => StatusCode::NOT_FOUND,
            JobApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            JobApiError::Job(JobError::State(_)) => StatusCode::BAD_REQUEST,
            JobApiError::Job(JobError::NotReady { .. }) => StatusCode::EXPECTATION_FAILED,
            JobApiError::Job(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Body of `POST /job`.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Backend URL work is POSTed to.
    pub url: String,

    /// Input queue capacity.
    pub maxsize: usize,

    /// Worker pool size.
    pub concurrency: usize,
}

/// One key/value element of the input and output JSON surfaces.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: serde_json::Value,
}

async fn lookup(app: &AppState, id: &str) -> Result<Arc<Job>, JobApiError> {
    let parsed = JobId::parse(id).map_err(|_| JobApiError::NotFound(id.to_string()))?;
    app.registry()
        .get(parsed)
        .await
        .ok_or_else(|| JobApiError::NotFound(id.to_string()))
}

/// `POST /job` — creates and starts a job.
pub async fn create_job_handler(
    State(app): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobDescription>), JobApiError> {
    let url = Url::parse(&req.url)
        .map_err(|e| JobApiError::BadRequest(format!("invalid backend url: {}", e)))?;

    let config = JobConfig::new(app.secret(), url, req.maxsize).with_db_path(app.db_path());
    let job = Job::create(config);
    job.start(req.concurrency).await?;

    info!(
        job_id = %job.id(),
        url = %req.url,
        maxsize = req.maxsize,
        concurrency = req.concurrency,
        "job created"
    );

    let description = job.describe();
    app.registry().insert(job).await;
    Ok((StatusCode::CREATED, Json(description)))
}

/// `GET /job/{id}` — job description.
pub async fn get_job_handler(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDescription>, JobApiError> {
    let job = lookup(&app, &id).await?;
    Ok(Json(job.describe()))
}

/// `PUT /job/{id}/input` — admits a batch of inputs.
///
/// Each value is arbitrary JSON; it is re-serialized to bytes before being
/// handed to the engine.
pub async fn add_inputs_handler(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(batch): Json<Vec<KeyValue>>,
) -> Result<(StatusCode, Json<JobDescription>), JobApiError> {
    let job = lookup(&app, &id).await?;

    let mut inputs = Vec::with_capacity(batch.len());
    for kv in batch {
        let value = serde_json::to_vec(&kv.value)
            .map_err(|e| JobApiError::BadRequest(format!("invalid input value: {}", e)))?;
        inputs.push(crate::types::Input::new(kv.key, value));
    }

    debug!(job_id = %job.id(), count = inputs.len(), "admitting inputs");
    job.add_inputs(inputs).await?;
    Ok((StatusCode::CREATED, Json(job.describe())))
}

/// `POST /job/{id}/complete` — declares the input set closed.
pub async fn complete_job_handler(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDescription>, JobApiError> {
    let job = lookup(&app, &id).await?;
    job.close_inputs().await?;
    info!(job_id = %job.id(), inputs = job.inputs_count(), "input set closed");
    Ok(Json(job.describe()))
}

/// `GET /job/{id}/output` — all successful results.
///
/// Blocks on the completion signal first, then checks state, then reads:
/// one path, no races. A job that failed at the storage level wakes the
/// wait without publishing and surfaces as 417.
pub async fn get_outputs_handler(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<KeyValue>>, JobApiError> {
    let job = lookup(&app, &id).await?;

    job.wait_complete().await;
    if job.state() != JobState::AllOutputReceived {
        return Err(JobApiError::Job(JobError::NotReady { id: job.id() }));
    }
    let results = job.get_results().await?;

    let body = results
        .into_iter()
        .map(|(key, value)| KeyValue {
            value: serde_json::from_slice(&value).unwrap_or_else(|_| {
                // Backends are not obliged to reply with JSON; fall back to
                // a JSON string of the raw bytes.
                serde_json::Value::String(String::from_utf8_lossy(&value).into_owned())
            }),
            key,
        })
        .collect();
    Ok(Json(body))
}

/// `DELETE /job/{id}` — unregisters the job and tears it down, waiting for
/// workers to exit and removing the job's store directory.
pub async fn delete_job_handler(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, JobApiError> {
    let parsed = JobId::parse(&id).map_err(|_| JobApiError::NotFound(id.clone()))?;
    let Some(job) = app.registry().remove(parsed).await else {
        return Err(JobApiError::NotFound(id));
    };

    job.delete().await?;
    Ok(StatusCode::OK)
}
