use crate::{db, AppState};
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
}

// GET /health/live
#[utoipa::path(
    get,
    path = "/health/live",
    responses((status = 200, description = "Process is up", body = HealthResponse)),
    tag = "Health"
)]
pub async fn live() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// GET /health/ready
#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "Datastore reachable", body = HealthResponse),
        (status = 503, description = "Datastore unreachable")
    ),
    tag = "Health"
)]
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    match db::check_connection(&state.db).await {
        Ok(()) => Ok(Json(HealthResponse { status: "ready" })),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "unavailable" }),
        )),
    }
}
