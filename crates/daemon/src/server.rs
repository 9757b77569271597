//! HTTP API: worker callbacks, media status and metrics.
//!
//! Workers report back through `/api/encodings/:id/*`; the dashboard polls
//! `/metrics` and `/api/media`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::error::PipelineError;
use crate::jobs::EncodingJob;
use crate::media::SourceMedia;
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::pipeline::{EncodeSummary, MediaDetail, MediaSummary, Pipeline};
use crate::profiles::ProfileId;
use crate::state_machine::{Completion, StateError};

/// Errors that can occur when running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server stopped: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handler error mapped onto a status code and a JSON body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            ApiError::Conflict(e) => (StatusCode::CONFLICT, e),
            ApiError::Unprocessable(e) => (StatusCode::UNPROCESSABLE_ENTITY, e),
            ApiError::Internal(e) => {
                tracing::warn!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StateError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            StateError::Store(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotFound(_) => ApiError::NotFound(e.to_string()),
            PipelineError::UnsupportedMedia { .. } | PipelineError::ProbeFailure { .. } => {
                ApiError::Unprocessable(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub metrics: SharedMetrics,
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    /// Copy instead of moving the file into the store.
    #[serde(default)]
    pub copy: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EncodeRequest {
    #[serde(default)]
    pub profiles: Option<Vec<ProfileId>>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunningReport {
    #[serde(default)]
    pub worker: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressReport {
    pub progress: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressAck {
    pub accepted: bool,
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.read().await.clone())
}

async fn list_media(State(state): State<AppState>) -> Json<Vec<MediaSummary>> {
    Json(state.pipeline.list_media().await)
}

async fn media_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<MediaDetail>, ApiError> {
    Ok(Json(state.pipeline.media_info(&id, query.full).await?))
}

async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<SourceMedia>), ApiError> {
    let media = state.pipeline.ingest(&req.path, req.title, req.copy).await?;
    Ok((StatusCode::CREATED, Json(media)))
}

async fn encode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EncodeRequest>,
) -> Result<Json<EncodeSummary>, ApiError> {
    Ok(Json(state.pipeline.encode(&id, req.profiles, req.force).await?))
}

async fn delete_media(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.pipeline.delete_media(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn report_running(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<RunningReport>,
) -> Result<Json<EncodingJob>, ApiError> {
    Ok(Json(state.pipeline.states().report_running(&id, &report.worker).await?))
}

async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<ProgressReport>,
) -> Result<Json<ProgressAck>, ApiError> {
    let accepted = state.pipeline.states().report_progress(&id, report.progress).await?;
    Ok(Json(ProgressAck { accepted }))
}

async fn report_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(completion): Json<Completion>,
) -> Result<Json<EncodingJob>, ApiError> {
    Ok(Json(state.pipeline.states().report_complete(&id, completion).await?))
}

async fn delete_encoding(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.pipeline.delete_encoding(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/media", get(list_media).post(ingest))
        .route("/api/media/:id", get(media_info).delete(delete_media))
        .route("/api/media/:id/encode", post(encode))
        .route("/api/encodings/:id", axum::routing::delete(delete_encoding))
        .route("/api/encodings/:id/running", post(report_running))
        .route("/api/encodings/:id/progress", post(report_progress))
        .route("/api/encodings/:id/complete", post(report_complete))
        .with_state(state)
}

/// Binds `bind` and serves the API until the process exits.
pub async fn run_server(bind: &str, state: AppState) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    tracing::info!(addr = %bind, "http server listening");
    axum::serve(listener, create_router(state))
        .await
        .map_err(ServerError::Serve)
}
