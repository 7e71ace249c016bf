//! Accounts API
//!
//! - POST /api/accounts - Create the demo and real accounts (idempotent)
//! - GET /api/accounts - Both balances
//! - GET /api/accounts/:kind/balance - One balance (zero when absent)
//! - POST /api/accounts/deposit - Credit the real account

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::auth::AuthUser;
use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::{AccountBalances, AccountKind};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_accounts).get(get_accounts))
        .route("/:kind/balance", get(get_balance))
        .route("/deposit", post(deposit))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub user_id: String,
    pub kind: AccountKind,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub amount: Option<Decimal>,
    pub location: Option<String>,
}

/// POST /api/accounts
async fn create_accounts(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ApiResponse<AccountBalances>>> {
    let balances = state.ledger.create_accounts(&user_id)?;
    Ok(Json(ApiResponse { data: balances }))
}

/// GET /api/accounts
async fn get_accounts(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ApiResponse<AccountBalances>>> {
    let balances = state.ledger.get_accounts(&user_id)?;
    Ok(Json(ApiResponse { data: balances }))
}

/// GET /api/accounts/:kind/balance
async fn get_balance(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(kind): Path<String>,
) -> Result<Json<ApiResponse<BalanceResponse>>> {
    let kind: AccountKind = kind.parse().map_err(AppError::BadRequest)?;
    let balance = state.ledger.get_balance(&user_id, kind)?;
    Ok(Json(ApiResponse {
        data: BalanceResponse {
            user_id,
            kind,
            balance,
        },
    }))
}

/// POST /api/accounts/deposit
async fn deposit(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<DepositRequest>,
) -> Result<Json<ApiResponse<BalanceResponse>>> {
    let amount = request
        .amount
        .ok_or_else(|| AppError::BadRequest("amount is required".to_string()))?;
    let balance = state
        .ledger
        .deposit_from(&user_id, amount, request.location.as_deref())?;

    Ok(Json(ApiResponse {
        data: BalanceResponse {
            user_id,
            kind: AccountKind::Real,
            balance,
        },
    }))
}
