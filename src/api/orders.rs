//! Orders API
//!
//! - POST /api/orders - Create an order
//! - GET /api/orders - The caller's orders, newest first
//! - GET /api/orders/open - Open orders of every user
//! - GET /api/orders/:id - One of the caller's orders
//! - DELETE /api/orders/:id - Cancel one of the caller's orders
//! - POST /api/orders/:id/execute - Record an external execution report

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::api::auth::AuthUser;
use crate::api::ApiResponse;
use crate::error::Result;
use crate::types::{CreateOrderRequest, Order};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/open", get(list_open_orders))
        .route("/:id", get(get_order).delete(cancel_order))
        .route("/:id/execute", post(execute_order))
}

/// POST /api/orders
async fn create_order(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Order>>)> {
    let order = state.orders.create_order(&user_id, request)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: order })))
}

/// GET /api/orders
async fn list_orders(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ApiResponse<Vec<Order>>>> {
    let orders = state.orders.list_user_orders(&user_id)?;
    Ok(Json(ApiResponse { data: orders }))
}

/// GET /api/orders/open
async fn list_open_orders(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Result<Json<ApiResponse<Vec<Order>>>> {
    let orders = state.orders.list_open_orders()?;
    Ok(Json(ApiResponse { data: orders }))
}

/// GET /api/orders/:id
async fn get_order(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Order>>> {
    let order = state.orders.get_order(&id, &user_id)?;
    Ok(Json(ApiResponse { data: order }))
}

/// DELETE /api/orders/:id
async fn cancel_order(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Order>>> {
    let order = state.orders.cancel_order(&id, &user_id)?;
    Ok(Json(ApiResponse { data: order }))
}

/// POST /api/orders/:id/execute
///
/// Execution happens outside this service; the caller is the reporting party
/// and must be one of the configured reporters.
async fn execute_order(
    State(state): State<AppState>,
    AuthUser(reporter): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Order>>> {
    info!("Execution of order {} reported by {}", id, reporter);
    let order = state.orders.execute_order(&id, &reporter)?;
    Ok(Json(ApiResponse { data: order }))
}
