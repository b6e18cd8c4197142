use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::error::AppError;

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    pub status: u16,
}

/// Map domain errors to HTTP responses in one place.
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let error = match err {
        AppError::Validation(_) | AppError::InvalidReference(_) => "validation_error",
        AppError::Unauthorized => "authentication_error",
        AppError::Forbidden => "authorization_error",
        AppError::NotFound => "not_found_error",
        AppError::AlreadyMember | AppError::Conflict(_) => "conflict_error",
        AppError::Config(_)
        | AppError::StartServer(_)
        | AppError::Database(_)
        | AppError::Internal => "server_error",
    };

    // Internal detail stays in the logs, not on the wire.
    let message = if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
        "internal server error".to_string()
    } else {
        err.to_string()
    };

    let response = ErrorResponse {
        error,
        message,
        status: status.as_u16(),
    };
    (status, response)
}

pub fn into_response(err: AppError) -> impl IntoResponse {
    let (status, response) = map_error(&err);
    (status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_403_authorization_error() {
        let (status, body) = map_error(&AppError::Forbidden);
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "authorization_error");
    }

    #[test]
    fn duplicate_membership_maps_to_409() {
        let (status, body) = map_error(&AppError::AlreadyMember);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "conflict_error");
    }

    #[test]
    fn server_errors_do_not_leak_detail() {
        let (status, body) = map_error(&AppError::Config("secret dsn".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "internal server error");
    }
}
