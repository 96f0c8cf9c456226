//! The web-facing error type and its mapping onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::dbio::DbioError;
use crate::describe::DescribeError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Dbio(#[from] DbioError),

    #[error(transparent)]
    Describe(#[from] DescribeError),

    #[error("Serialization/Deserialization error")]
    Serde(#[from] serde_json::Error),

    #[error("JWT error")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream service failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn bad_request(what: impl Into<String>) -> Self {
        AppError::BadRequest(what.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Dbio(e) => match e {
                DbioError::NotFound { .. } => StatusCode::NOT_FOUND,
                DbioError::NotAuthorized { .. } => StatusCode::UNAUTHORIZED,
                DbioError::AlreadyExists(_)
                | DbioError::InvalidRecord { .. }
                | DbioError::InvalidUpdate { .. }
                | DbioError::PartNotAccessible { .. }
                | DbioError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
                DbioError::NotEditable { .. }
                | DbioError::NotSubmitable { .. }
                | DbioError::SubmissionFailed { .. } => StatusCode::CONFLICT,
                DbioError::Config(_) | DbioError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Describe(e) => match e {
                DescribeError::IdNotFound(_) => StatusCode::NOT_FOUND,
                DescribeError::ClientError { .. } => StatusCode::BAD_GATEWAY,
                DescribeError::ServerError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Serde(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Jwt(_) | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        let errors = match &self {
            AppError::Dbio(e) if !e.errors().is_empty() => Some(e.errors().to_vec()),
            _ => None,
        };
        let body = Json(ErrorResponse { message: self.to_string(), errors });

        log::warn!("Error response sent: {self}");
        (status_code, body).into_response()
    }
}

/// The JSON body used for non-error statuses carrying just a message.
pub fn message_body(message: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": message }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Dbio(DbioError::not_found("x")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Dbio(DbioError::NotEditable { id: "x".into() }).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Dbio(DbioError::invalid_update("x", None, vec!["bad".into()]))
                .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Describe(DescribeError::IdNotFound("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
    }
}
