use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::carts::CheckoutError;
use crate::queries::QueryError;
use crate::reconcile::ReconcileError;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "Request failed");
        }
        (status, Json(ErrorResponse { message: self.to_string() })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Storage error");
        ApiError::Internal("Internal server error".to_string())
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::InvalidSignature(_)
            | ReconcileError::MalformedEvent(_)
            | ReconcileError::MissingCartId
            | ReconcileError::CartNotFound(_) => ApiError::BadRequest(e.to_string()),
            ReconcileError::Unfulfillable { .. } => ApiError::Conflict(e.to_string()),
            ReconcileError::Storage(e) => e.into(),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::Cart(_) | CheckoutError::UnknownProduct(_) | CheckoutError::Unavailable(_) => {
                ApiError::BadRequest(e.to_string())
            }
            CheckoutError::Gateway(e) => {
                tracing::error!(error = %e, "Payment gateway error");
                ApiError::BadGateway("Payment provider unavailable".to_string())
            }
            CheckoutError::Store(e) => e.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotFound => ApiError::NotFound("Not found".to_string()),
            QueryError::Invalid(message) => ApiError::BadRequest(message),
            QueryError::Store(e) => e.into(),
            QueryError::Notify(e) => {
                tracing::error!(error = %e, "Notification error");
                ApiError::Internal("Failed to send notification".to_string())
            }
        }
    }
}
