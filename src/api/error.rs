//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                      | Key Methods         |
// |-----------------|--------------------------------------------------|---------------------|
// | ApiError        | Error types for the API                          | from, into_response |
//--------------------------------------------------------------------------------------------------

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rabbitmq::RabbitMQError;
use serde_json::json;
use thiserror::Error;

use crate::domain::services::payment_repository::RepositoryError;

/// Type alias for Result with ApiError
pub type ApiResult<T> = Result<T, ApiError>;

/// API-specific error types
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// The requested resource was not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The request was invalid
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The request was stored but its event could not be handed to the broker
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::BrokerUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::BrokerUnavailable(msg)
            | Self::Internal(msg) => msg,
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "message": error_message,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => Self::NotFound(format!("Payment {} not found", id)),
            err @ (RepositoryError::DuplicateUser(_) | RepositoryError::Invalid(_)) => {
                Self::BadRequest(err.to_string())
            }
        }
    }
}

impl From<RabbitMQError> for ApiError {
    fn from(err: RabbitMQError) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }
}
