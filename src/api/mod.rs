//! HTTP façade: a thin axum adapter over the orchestrator service.
//!
//! All routes live under `/api/v1`. Every request carries an
//! `X-Request-Id` (generated when absent and echoed in the response);
//! the SSE fan-out reads from the store only and never shares mutable
//! state with the executors.

mod jobs;
mod skills;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::service::{OrchestratorService, ServiceError};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrchestratorService>,
    /// Multipart body ceiling, derived from the upload limit.
    pub max_body_bytes: usize,
}

/// Build the `/api/v1` router.
pub fn router(state: AppState) -> Router {
    let max_body = state.max_body_bytes;
    let api = Router::new()
        .route("/jobs", post(jobs::create_job))
        .route("/jobs/{id}/start", post(jobs::start_job))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/events", get(jobs::job_events))
        .route("/jobs/{id}/abort", post(jobs::abort_job))
        .route("/jobs/{id}/artifacts", get(jobs::list_artifacts))
        .route("/jobs/{id}/download", get(jobs::download_bundle))
        .route(
            "/jobs/{id}/artifacts/{artifact_id}/download",
            get(jobs::download_artifact),
        )
        .route("/skills", get(skills::list_skills))
        .route("/skills/{code}", get(skills::get_skill))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn(request_id_middleware))
}

/// Serve the API until the process exits.
pub async fn serve(
    state: AppState,
    bind_addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = router(state);
    tracing::info!("API listening on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Generate-if-absent and echo the request id.
async fn request_id_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Wrapper mapping service failures onto HTTP statuses.
pub(crate) struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::InvalidInput { .. } | ServiceError::Terminal { .. } => {
                axum::http::StatusCode::BAD_REQUEST
            }
            ServiceError::NotFound { .. } => axum::http::StatusCode::NOT_FOUND,
            ServiceError::Conflict { .. } => axum::http::StatusCode::CONFLICT,
            ServiceError::AgentUnavailable { .. } => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal { .. } => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "detail": self.0.to_string() }))).into_response()
    }
}
