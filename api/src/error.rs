use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::PreconditionFailed(_) => "precondition_failed",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::DeliveryFailed(_) => "delivery_failed",
            AppError::BadGateway(_) => "bad_gateway",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PreconditionFailed(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::DeliveryFailed(_) | AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::PreconditionFailed(msg)
            | AppError::Forbidden(msg)
            | AppError::Conflict(msg)
            | AppError::DeliveryFailed(msg)
            | AppError::BadGateway(msg)
            | AppError::Config(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        tracing::debug!("database error: {e}");
        AppError::Internal("database error".into())
    }
}

impl From<zapflow_common::error::ZapflowError> for AppError {
    fn from(e: zapflow_common::error::ZapflowError) -> Self {
        AppError::PreconditionFailed(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Config(_)) {
            tracing::error!("{self}");
        }
        let body = serde_json::json!({
            "success": false,
            "error": self.message(),
            "kind": self.kind(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
