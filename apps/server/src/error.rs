use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bankfeed_core::Error;
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Unprocessable(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m),
            Self::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidArgument(_) => Self::BadRequest(message),
            Error::InvalidState(_) => Self::Conflict(message),
            Error::AuthFailed(_) => Self::Unauthorized(message),
            Error::Validation(_) => Self::Unprocessable(message),
            Error::ProviderUnavailable(_) | Error::Ledger(_) => Self::Unavailable(message),
            Error::Storage(_) | Error::Serialization(_) => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!("API error ({}): {}", status, message);
        }
        (status, Json(ErrorBody { code, message })).into_response()
    }
}
