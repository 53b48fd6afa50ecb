//! Archive generation endpoints: request, poll, download, order selection,
//! plus the dead-letter listing for operators.

use super::object_handlers::stream_object;
use crate::{
    errors::AppError,
    models::zip_job::{ArchiveKind, JobKey, JobStatus, StatusView},
    pipeline::{
        layout::source_prefix,
        router::{RouteOutcome, Strategy},
    },
    services::dead_letters::DeadLetter,
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Optional body of an archive request: a precomputed manifest.
#[derive(Debug, Default, Deserialize)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResponse {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<i64>,
}

impl ArchiveResponse {
    fn status(status: JobStatus) -> Self {
        Self {
            status,
            run_id: None,
            execution_id: None,
            strategy: None,
            worker_count: None,
            file_count: None,
            result_key: None,
            result_size: None,
        }
    }

    fn from_outcome(outcome: RouteOutcome) -> (StatusCode, Self) {
        match outcome {
            RouteOutcome::ManifestEmpty => (StatusCode::OK, ArchiveResponse::status(JobStatus::None)),
            RouteOutcome::Ready {
                run_id,
                result_key,
                result_size,
            } => (
                StatusCode::OK,
                ArchiveResponse {
                    run_id: Some(run_id),
                    result_key: Some(result_key),
                    result_size: Some(result_size),
                    ..ArchiveResponse::status(JobStatus::Ready)
                },
            ),
            RouteOutcome::InProgress { run_id } => (
                StatusCode::ACCEPTED,
                ArchiveResponse {
                    run_id: Some(run_id),
                    ..ArchiveResponse::status(JobStatus::Generating)
                },
            ),
            RouteOutcome::Started {
                run_id,
                execution_id,
                strategy,
                worker_count,
                file_count,
            } => (
                StatusCode::ACCEPTED,
                ArchiveResponse {
                    run_id: Some(run_id),
                    execution_id: Some(execution_id),
                    strategy: Some(strategy),
                    worker_count: Some(worker_count),
                    file_count: Some(file_count),
                    ..ArchiveResponse::status(JobStatus::Generating)
                },
            ),
        }
    }
}

/// POST `/galleries/{gallery_id}/orders/{order_id}/archives/{kind}`
pub async fn request_archive(
    State(state): State<AppState>,
    Path((gallery_id, order_id, kind)): Path<(String, String, ArchiveKind)>,
    body: Bytes,
) -> Result<Response, AppError> {
    let job = JobKey::new(gallery_id, order_id, kind)?;
    let request = if body.is_empty() {
        ArchiveRequest::default()
    } else {
        serde_json::from_slice::<ArchiveRequest>(&body)
            .map_err(|err| AppError::bad_request(format!("invalid request body: {err}")))?
    };

    let router = &state.pipeline.router;
    let outcome = match request.keys {
        Some(keys) => {
            let prefix = source_prefix(&job);
            if let Some(stray) = keys.iter().find(|k| !k.starts_with(&prefix)) {
                return Err(AppError::bad_request(format!(
                    "key `{stray}` is outside `{prefix}`"
                )));
            }
            router.request_with_keys(&job, keys).await?
        }
        None => router.request(&job).await?,
    };

    let (status, body) = ArchiveResponse::from_outcome(outcome);
    Ok((status, Json(body)).into_response())
}

/// GET `/galleries/{gallery_id}/orders/{order_id}/archives/{kind}`
pub async fn archive_status(
    State(state): State<AppState>,
    Path((gallery_id, order_id, kind)): Path<(String, String, ArchiveKind)>,
) -> Result<Json<StatusView>, AppError> {
    let job = JobKey::new(gallery_id, order_id, kind)?;
    Ok(Json(state.pipeline.router.status(&job).await?))
}

/// GET `/galleries/{gallery_id}/orders/{order_id}/archives/{kind}/download`
pub async fn download_archive(
    State(state): State<AppState>,
    Path((gallery_id, order_id, kind)): Path<(String, String, ArchiveKind)>,
) -> Result<Response, AppError> {
    let job = JobKey::new(gallery_id, order_id, kind)?;
    let view = state.pipeline.router.status(&job).await?;
    match (view.status, view.result_key) {
        (JobStatus::Ready, Some(result_key)) => stream_object(&state.storage, &result_key).await,
        (status, _) => Err(AppError::conflict(format!(
            "archive for {job} is not ready (status {status:?})"
        ))),
    }
}

/// PUT `/galleries/{gallery_id}/orders/{order_id}/selection`
///
/// Scopes the order's originals archive to the given keys. An empty list
/// clears the selection.
pub async fn put_selection(
    State(state): State<AppState>,
    Path((gallery_id, order_id)): Path<(String, String)>,
    Json(request): Json<SelectionRequest>,
) -> Result<StatusCode, AppError> {
    let job = JobKey::new(gallery_id, order_id, ArchiveKind::Originals)?;
    let prefix = source_prefix(&job);
    if let Some(stray) = request.keys.iter().find(|k| !k.starts_with(&prefix)) {
        return Err(AppError::bad_request(format!(
            "key `{stray}` is outside `{prefix}`"
        )));
    }
    state
        .pipeline
        .jobs
        .replace_selection(&job.gallery_id, &job.order_id, &request.keys)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/admin/dead-letters`: newest first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    Ok(Json(state.pipeline.dead_letters.list().await?))
}
