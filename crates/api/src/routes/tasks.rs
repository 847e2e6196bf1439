//! Task lifecycle counter hooks
//!
//! Called by the task CRUD layer after it creates or deletes a task. The
//! created hook re-checks the entitlement so a race between check and
//! create cannot push a Free user past their limit.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Serialize)]
pub struct TaskCountResponse {
    pub task_count: i64,
}

/// POST /api/v1/tasks/created
pub async fn task_created(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<axum::response::Response> {
    let decision = state.entitlements.can_create_task(user.user_id).await?;
    if !decision.allowed {
        return Ok((StatusCode::FORBIDDEN, Json(decision)).into_response());
    }

    let task_count = state.entitlements.increment_task_count(user.user_id).await?;
    Ok(Json(TaskCountResponse { task_count }).into_response())
}

/// POST /api/v1/tasks/deleted
pub async fn task_deleted(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<TaskCountResponse>> {
    let task_count = state.entitlements.decrement_task_count(user.user_id).await?;
    Ok(Json(TaskCountResponse { task_count }))
}
