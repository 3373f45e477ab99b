//! HTTP error mapping.
//!
//! Input problems map to 4xx with a JSON `detail`; unexpected backend
//! failures are logged and surfaced as an opaque 500 so the payment
//! provider redelivers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::accounting::AccountingError;
use crate::mockpay::WebhookError;
use crate::orders::OrderStoreError;
use crate::paysession::SessionStoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("sold out")]
    SoldOut,

    #[error("authentication required")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        ApiError::BadRequest(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        ApiError::NotFound(detail.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SoldOut => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            // backend detail stays in the logs, not on the wire
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "request failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({ "detail": detail }));
        if matches!(self, ApiError::Unauthorized) {
            (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"admin\"")],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl From<AccountingError> for ApiError {
    fn from(e: AccountingError) -> Self {
        match e {
            AccountingError::UnknownClass(cls) => {
                ApiError::BadRequest(format!("invalid ticket class '{cls}'"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SessionStoreError> for ApiError {
    fn from(e: SessionStoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<OrderStoreError> for ApiError {
    fn from(e: OrderStoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}
