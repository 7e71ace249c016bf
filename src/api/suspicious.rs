//! Suspicious activity API
//!
//! - GET /api/suspicious - All records, newest first
//! - POST /api/suspicious - Manual report by the caller
//! - GET /api/suspicious/:id - One record
//! - PATCH /api/suspicious/:id - Move a record through review

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::{ActivityStatus, SuspiciousActivityRecord};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_activities).post(report_activity))
        .route("/:id", get(get_activity).patch(update_activity))
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub status: Option<String>,
    pub comments: Option<String>,
}

/// GET /api/suspicious
async fn list_activities(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<Json<ApiResponse<Vec<SuspiciousActivityRecord>>>> {
    Ok(Json(ApiResponse {
        data: state.monitor.list()?,
    }))
}

/// POST /api/suspicious
async fn report_activity(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<ReportRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SuspiciousActivityRecord>>)> {
    let description = request.description.unwrap_or_default();
    let record = state.monitor.report(&user_id, &description)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: record })))
}

/// GET /api/suspicious/:id
async fn get_activity(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<SuspiciousActivityRecord>>> {
    Ok(Json(ApiResponse {
        data: state.monitor.get(&id)?,
    }))
}

/// PATCH /api/suspicious/:id
async fn update_activity(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<ApiResponse<SuspiciousActivityRecord>>> {
    let status: ActivityStatus = request
        .status
        .ok_or_else(|| AppError::BadRequest("status is required".to_string()))?
        .parse()
        .map_err(AppError::BadRequest)?;

    let record = state
        .monitor
        .update_status(&id, status, request.comments.as_deref())?;
    Ok(Json(ApiResponse { data: record }))
}
