//! Candles API
//!
//! - GET /api/candles?symbol=&interval=&start=&end= - Stored closed candles, oldest first
//! - GET /api/candles/latest - Latest close of every live stream

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::{Candle, LatestPrice};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_candles))
        .route("/latest", get(get_latest))
}

/// Range bounds are RFC 3339 timestamps matched against the close time.
#[derive(Debug, Deserialize)]
pub struct CandleQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// GET /api/candles
async fn get_candles(
    State(state): State<AppState>,
    Query(query): Query<CandleQuery>,
) -> Result<Json<ApiResponse<Vec<Candle>>>> {
    let (Some(symbol), Some(interval)) = (query.symbol, query.interval) else {
        return Err(AppError::BadRequest(
            "symbol and interval are required".to_string(),
        ));
    };
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if start > end {
            return Err(AppError::BadRequest("start is after end".to_string()));
        }
    }

    let candles = state
        .candles
        .range(&symbol, &interval, query.start, query.end)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(ApiResponse { data: candles }))
}

/// GET /api/candles/latest
async fn get_latest(State(state): State<AppState>) -> Json<ApiResponse<Vec<LatestPrice>>> {
    Json(ApiResponse {
        data: state.candles.latest_prices(),
    })
}
