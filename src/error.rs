use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::mpesa::MpesaError;
use crate::services::EngineError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::GatewayRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => AppError::Validation(msg),
            EngineError::NotFound(what) => AppError::NotFound(what),
            EngineError::UnknownCorrelation(id) => {
                AppError::NotFound(format!("donation for checkout request {id}"))
            }
            EngineError::GatewayUnavailable => {
                AppError::ServiceUnavailable("M-Pesa payments are not configured".to_string())
            }
            EngineError::Gateway(MpesaError::AuthFailure(reason)) => {
                AppError::ServiceUnavailable(reason)
            }
            EngineError::Gateway(MpesaError::Unreachable(reason)) => {
                AppError::ServiceUnavailable(format!("payment provider unreachable: {reason}"))
            }
            EngineError::Gateway(MpesaError::CircuitOpen) => AppError::ServiceUnavailable(
                "payment provider unreachable: circuit breaker open".to_string(),
            ),
            EngineError::Gateway(MpesaError::Rejected { code, message }) => {
                AppError::GatewayRejected(format!("{code}: {message}"))
            }
            EngineError::Gateway(source) => AppError::GatewayRejected(source.to_string()),
            EngineError::Storage(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_status_code() {
        let error = AppError::Validation("Invalid amount".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_error_status_code() {
        let error = AppError::NotFound("Donation not found".to_string());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_service_unavailable_status_code() {
        let error = AppError::ServiceUnavailable("gateway down".to_string());
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_gateway_rejection_maps_to_bad_gateway() {
        let err: AppError = EngineError::Gateway(MpesaError::Rejected {
            code: "400.002.02".to_string(),
            message: "Bad Request - Invalid PhoneNumber".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_auth_failure_maps_to_service_unavailable() {
        let err: AppError =
            EngineError::Gateway(MpesaError::AuthFailure("credentials rejected".to_string()))
                .into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_validation_error_response() {
        let error = AppError::Validation("Amount must be positive".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
