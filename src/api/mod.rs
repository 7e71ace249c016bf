pub mod accounts;
pub mod auth;
pub mod candles;
pub mod health;
pub mod orders;
pub mod suspicious;

use crate::AppState;
use axum::Router;
use serde::Serialize;

/// Success envelope of every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/accounts", accounts::router())
        .nest("/api/orders", orders::router())
        .nest("/api/candles", candles::router())
        .nest("/api/suspicious", suspicious::router())
}
