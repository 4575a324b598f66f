//! Skill catalog endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::skills::SkillDescriptor;

#[derive(Debug, Deserialize)]
pub(crate) struct SkillListQuery {
    task_type: Option<String>,
}

/// GET /skills
pub(crate) async fn list_skills(
    State(state): State<AppState>,
    Query(query): Query<SkillListQuery>,
) -> Json<Vec<SkillDescriptor>> {
    Json(state.service.list_skills(query.task_type.as_deref()))
}

/// GET /skills/{code}
pub(crate) async fn get_skill(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.service.get_skill(&code)?))
}
