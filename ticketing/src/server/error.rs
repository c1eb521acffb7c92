//! Error responses for the HTTP API.
//!
//! Every failure leaves the server as `{"code": ..., "message": ...}`.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use impact_core::ImpactError;
use serde::Serialize;

/// Error returned by handlers.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Create an error with an explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// HTTP status of the response
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code of the response
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl From<ImpactError> for ApiError {
    fn from(err: ImpactError) -> Self {
        let message = err.to_string();
        match err {
            ImpactError::Validation(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
            }
            ImpactError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            ImpactError::CapacityExceeded { .. } => {
                Self::new(StatusCode::CONFLICT, "CAPACITY_EXCEEDED", message)
            }
            ImpactError::LedgerTimeout { .. } => Self::new(StatusCode::ACCEPTED, "PENDING", message),
            ImpactError::LedgerRejected { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "LEDGER_REJECTED", message)
            }
            ImpactError::InconsistentState { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INCONSISTENT_STATE",
                message,
            ),
            ImpactError::Storage(source) => {
                tracing::error!(error = %source, "Storage failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

/// Check the `Authorization: Bearer` header against `expected`.
///
/// # Errors
///
/// [`ApiError::unauthorized`] when no token is configured, the header is
/// missing, or the token differs.
pub fn require_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::unauthorized("this endpoint is disabled"));
    };
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if constant_time_eq::constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            Ok(())
        }
        Some(_) => Err(ApiError::unauthorized("invalid bearer token")),
        None => Err(ApiError::unauthorized("missing bearer token")),
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use impact_core::StoreError;

    #[test]
    fn capacity_maps_to_conflict() {
        let err = ApiError::from(ImpactError::CapacityExceeded {
            event_id: "e1".to_string(),
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "CAPACITY_EXCEEDED");
    }

    #[test]
    fn unknown_outcomes_are_accepted_not_failed() {
        let err = ApiError::from(ImpactError::LedgerTimeout {
            key: "donation:ref1".to_string(),
        });
        assert_eq!(err.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn storage_details_are_not_exposed() {
        let err = ApiError::from(ImpactError::Storage(StoreError::Database(
            "password authentication failed".to_string(),
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "[INTERNAL_SERVER_ERROR] An internal error occurred");
    }

    #[test]
    fn bearer_tokens_must_match() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            require_bearer(&headers, Some("s3cret")).map_err(|e| e.status()),
            Err(StatusCode::UNAUTHORIZED)
        );

        headers.insert(AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(require_bearer(&headers, Some("s3cret")).is_err());

        headers.insert(AUTHORIZATION, "Bearer s3cre".parse().unwrap());
        assert!(require_bearer(&headers, Some("s3cret")).is_err());

        headers.insert(AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert!(require_bearer(&headers, Some("s3cret")).is_ok());
        assert!(require_bearer(&headers, None).is_err());
    }
}
