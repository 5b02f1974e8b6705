use crate::{
    entities::provisioning_task,
    errors::ServiceError,
    services::provisioning::{TaskStats, TaskStatus},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 200;

#[derive(Debug, Deserialize, IntoParams)]
pub struct TaskListQuery {
    /// Filter by lifecycle status (pending | in_progress | succeeded | failed)
    pub status: Option<String>,
    /// Only in-progress tasks whose lease has expired
    #[serde(default)]
    pub stale: bool,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct FailedListQuery {
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskListResponse {
    #[schema(value_type = Vec<Object>)]
    pub tasks: Vec<provisioning_task::Model>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearFailedResponse {
    pub removed: u64,
}

fn page_size(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

// GET /api/v1/tasks
#[utoipa::path(
    get,
    path = "/api/v1/tasks",
    params(TaskListQuery),
    responses(
        (status = 200, description = "Provisioning task backlog", body = TaskListResponse),
        (status = 400, description = "Unknown status filter", body = crate::errors::ErrorResponse)
    ),
    tag = "Tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<TaskListResponse>, ServiceError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<TaskStatus>().map_err(|_| {
                ServiceError::BadRequest(format!("unknown task status filter: {}", raw))
            })
        })
        .transpose()?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = page_size(query.limit);

    let (tasks, total) = state
        .provisioning
        .list_tasks(status, query.stale, page, limit)
        .await?;

    Ok(Json(TaskListResponse {
        tasks,
        total,
        page,
        limit,
    }))
}

// GET /api/v1/tasks/stats
#[utoipa::path(
    get,
    path = "/api/v1/tasks/stats",
    responses(
        (status = 200, description = "Backlog aggregates", body = TaskStats)
    ),
    tag = "Tasks"
)]
pub async fn task_stats(State(state): State<AppState>) -> Result<Json<TaskStats>, ServiceError> {
    Ok(Json(state.provisioning.stats().await?))
}

// GET /api/v1/tasks/failed
#[utoipa::path(
    get,
    path = "/api/v1/tasks/failed",
    params(FailedListQuery),
    responses(
        (status = 200, description = "Most recent failed tasks", body = Vec<Object>)
    ),
    tag = "Tasks"
)]
pub async fn list_failed_tasks(
    State(state): State<AppState>,
    Query(query): Query<FailedListQuery>,
) -> Result<Json<Vec<provisioning_task::Model>>, ServiceError> {
    let tasks = state.provisioning.list_failed(page_size(query.limit)).await?;
    Ok(Json(tasks))
}

// DELETE /api/v1/tasks/failed
#[utoipa::path(
    delete,
    path = "/api/v1/tasks/failed",
    responses(
        (status = 200, description = "Failed tasks removed", body = ClearFailedResponse)
    ),
    tag = "Tasks"
)]
pub async fn clear_failed_tasks(
    State(state): State<AppState>,
) -> Result<Json<ClearFailedResponse>, ServiceError> {
    let removed = state.provisioning.clear_failed().await?;
    Ok(Json(ClearFailedResponse { removed }))
}

// GET /api/v1/tasks/:id
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Provisioning task", body = Object),
        (status = 404, description = "No such task", body = crate::errors::ErrorResponse)
    ),
    tag = "Tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<provisioning_task::Model>, ServiceError> {
    let task = state
        .provisioning
        .get_task(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("provisioning task {} not found", id)))?;
    Ok(Json(task))
}

// POST /api/v1/tasks/:id/retry
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/retry",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task reset to pending", body = Object),
        (status = 400, description = "Task is not in the failed state", body = crate::errors::ErrorResponse),
        (status = 404, description = "No such task", body = crate::errors::ErrorResponse)
    ),
    tag = "Tasks"
)]
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<provisioning_task::Model>), ServiceError> {
    let task = state.provisioning.retry(id).await?;
    Ok((StatusCode::OK, Json(task)))
}
