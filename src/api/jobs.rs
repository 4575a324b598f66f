//! Job endpoints: create, start, query, abort, events (SSE), artifacts.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::domain::{JobStatus, ModelRef};
use crate::service::{CreateJobRequest, OrchestratorService, ServiceError, UploadedFile};
use crate::store::{Job, JobEvent, JobFile};

#[derive(Debug, Serialize)]
pub(crate) struct JobCreateResponse {
    job_id: Uuid,
    status: JobStatus,
    selected_skill: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct JobStartResponse {
    job_id: Uuid,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
pub(crate) struct JobDetailResponse {
    job_id: Uuid,
    status: JobStatus,
    session_id: Option<String>,
    selected_skill: String,
    agent: String,
    model: Option<ModelRef>,
    error_code: Option<String>,
    error_message: Option<String>,
    download_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobDetailResponse {
    fn from_job(job: Job) -> Self {
        let download_url = job
            .result_bundle_path
            .as_ref()
            .map(|_| format!("/api/v1/jobs/{}/download", job.id));
        Self {
            job_id: job.id,
            status: job.status,
            session_id: job.session_id,
            selected_skill: job.selected_skill,
            agent: job.agent,
            model: job.model,
            error_code: job.error_code,
            error_message: job.error_message,
            download_url,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactItem {
    id: i64,
    category: String,
    relative_path: String,
    mime_type: Option<String>,
    size_bytes: u64,
    sha256: String,
    created_at: DateTime<Utc>,
}

impl From<JobFile> for ArtifactItem {
    fn from(file: JobFile) -> Self {
        Self {
            id: file.id,
            category: file.category.as_str().to_string(),
            relative_path: file.relative_path,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            sha256: file.sha256,
            created_at: file.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactListResponse {
    job_id: Uuid,
    artifacts: Vec<ArtifactItem>,
    bundle_ready: bool,
}

fn invalid(reason: impl Into<String>) -> ApiError {
    ApiError(ServiceError::InvalidInput {
        reason: reason.into(),
    })
}

/// POST /jobs — multipart create.
pub(crate) async fn create_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobCreateResponse>), ApiError> {
    let mut request = CreateJobRequest::default();
    let mut model_provider_id: Option<String> = None;
    let mut model_id: Option<String> = None;
    let mut output_contract_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let content_type = field.content_type().map(str::to_string);
                let content = field
                    .bytes()
                    .await
                    .map_err(|e| invalid(format!("failed to read upload {filename}: {e}")))?;
                request.files.push(UploadedFile {
                    filename,
                    content: content.to_vec(),
                    content_type,
                });
            }
            "requirement" => request.requirement = text_field(field, "requirement").await?,
            "skill_code" => request.skill_code = Some(text_field(field, "skill_code").await?),
            "agent" => request.agent = Some(text_field(field, "agent").await?),
            "model_provider_id" => {
                model_provider_id = Some(text_field(field, "model_provider_id").await?)
            }
            "model_id" => model_id = Some(text_field(field, "model_id").await?),
            "output_contract" => {
                output_contract_raw = Some(text_field(field, "output_contract").await?)
            }
            "idempotency_key" => {
                request.idempotency_key = Some(text_field(field, "idempotency_key").await?)
            }
            _ => {}
        }
    }

    // Provider and model must come together; half a pair would make the
    // model selection ambiguous downstream.
    request.model = match (model_provider_id, model_id) {
        (Some(provider_id), Some(model_id)) => Some(ModelRef {
            provider_id,
            model_id,
        }),
        (None, None) => None,
        _ => {
            return Err(invalid(
                "model_provider_id and model_id must be provided together",
            ))
        }
    };
    if let Some(raw) = output_contract_raw {
        request.output_contract = Some(
            serde_json::from_str(&raw)
                .map_err(|e| invalid(format!("invalid output_contract JSON: {e}")))?,
        );
    }

    tracing::info!(
        requirement_len = request.requirement.len(),
        file_count = request.files.len(),
        "create_job requested"
    );
    let job = state.service.create_job(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(JobCreateResponse {
            job_id: job.id,
            status: job.status,
            selected_skill: job.selected_skill,
        }),
    ))
}

async fn text_field(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| invalid(format!("invalid field {name}: {e}")))
}

/// POST /jobs/{id}/start
pub(crate) async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStartResponse>, ApiError> {
    let job = state.service.start_job(job_id).await?;
    Ok(Json(JobStartResponse {
        job_id: job.id,
        status: job.status,
    }))
}

/// GET /jobs/{id}
pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state.service.get_job(job_id).await?;
    Ok(Json(JobDetailResponse::from_job(job)))
}

/// POST /jobs/{id}/abort
pub(crate) async fn abort_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state.service.abort_job(job_id).await?;
    Ok(Json(JobDetailResponse::from_job(job)))
}

/// GET /jobs/{id}/artifacts
pub(crate) async fn list_artifacts(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ArtifactListResponse>, ApiError> {
    let listing = state.service.list_artifacts(job_id).await?;
    Ok(Json(ArtifactListResponse {
        job_id,
        artifacts: listing.artifacts.into_iter().map(ArtifactItem::from).collect(),
        bundle_ready: listing.bundle_ready,
    }))
}

/// GET /jobs/{id}/download — the result bundle.
pub(crate) async fn download_bundle(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let path = state.service.bundle_path(job_id).await?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        ApiError(ServiceError::Internal {
            reason: format!("failed to read bundle: {e}"),
        })
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"result.zip\"".to_string(),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// GET /jobs/{id}/artifacts/{artifact_id}/download — a single artifact.
pub(crate) async fn download_artifact(
    State(state): State<AppState>,
    Path((job_id, artifact_id)): Path<(Uuid, i64)>,
) -> Result<Response, ApiError> {
    let (path, artifact) = state.service.artifact_path(job_id, artifact_id).await?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        ApiError(ServiceError::Internal {
            reason: format!("failed to read artifact: {e}"),
        })
    })?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let content_type = artifact
        .mime_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Cursor state for one SSE connection.
struct EventStreamState {
    service: Arc<OrchestratorService>,
    job_id: Uuid,
    last_id: i64,
    idle_polls: u32,
    buffer: VecDeque<SseEvent>,
    done: bool,
}

/// GET /jobs/{id}/events — server-sent events.
///
/// Periodically polls the store with a cursor and closes once the job
/// has sat in a terminal state for two idle polls, so late events still
/// flush before the stream ends. Heartbeat comments come from the
/// keep-alive layer at 15 s.
pub(crate) async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    // 404 before the stream starts.
    state.service.get_job(job_id).await?;

    let stream_state = EventStreamState {
        service: Arc::clone(&state.service),
        job_id,
        last_id: 0,
        idle_polls: 0,
        buffer: VecDeque::new(),
        done: false,
    };

    let stream = futures_util::stream::unfold(stream_state, |mut st| async move {
        loop {
            if let Some(event) = st.buffer.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }

            let events = st
                .service
                .list_events(st.job_id, st.last_id, 200)
                .await
                .unwrap_or_default();
            if events.is_empty() {
                st.idle_polls += 1;
                let terminal = match st.service.get_job(st.job_id).await {
                    Ok(job) => job.status.is_terminal(),
                    Err(_) => true,
                };
                if terminal && st.idle_polls >= 2 {
                    st.done = true;
                    continue;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            } else {
                st.idle_polls = 0;
                for event in events {
                    st.last_id = st.last_id.max(event.id);
                    st.buffer.push_back(event_to_sse(&event));
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn event_to_sse(event: &JobEvent) -> SseEvent {
    let payload = serde_json::json!({
        "job_id": event.job_id.to_string(),
        "status": event.status.map(|s| s.as_str()),
        "source": event.source.as_str(),
        "event_type": event.event_type,
        "message": event.message,
        "payload": event.payload,
        "created_at": event.created_at.to_rfc3339(),
    });
    SseEvent::default()
        .event(event.event_type.clone())
        .data(payload.to_string())
}
