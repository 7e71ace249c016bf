use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

/// Failures of the account ledger and the order book.
///
/// Every variant maps to a stable machine-readable kind (see [`LedgerError::kind`]);
/// the `Display` text is the human-readable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid amount: {0} (must be greater than zero)")]
    InvalidAmount(Decimal),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Account not found: {kind} account of user {user_id}")]
    AccountNotFound { user_id: String, kind: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state: order is {0}, expected open")]
    InvalidState(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Stable error kind reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::AccountNotFound { .. } => "account_not_found",
            LedgerError::Forbidden(_) => "forbidden",
            LedgerError::InvalidState(_) => "invalid_state",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::Storage(_) => "storage_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            LedgerError::Validation(_) | LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) | LedgerError::AccountNotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::InvalidState(_) | LedgerError::InsufficientFunds { .. } => {
                StatusCode::CONFLICT
            }
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Failures inside the market-data stream layer. These are handled by the
/// subscription supervisor and never reach request handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Storage or network hiccup that is worth retrying.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The feed connection dropped or could not be established.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A frame could not be decoded. The frame is skipped.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl From<rusqlite::Error> for StreamError {
    fn from(e: rusqlite::Error) -> Self {
        StreamError::TransientIo(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::ConnectionLost(e.to_string())
    }
}

/// Application error types returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Ledger(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            AppError::Ledger(e) => (e.status(), e.kind()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": kind,
            "message": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
