//! HTTP error mapping

use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use obfusq_core::{ObfuscationError, ObfuscationResult};

/// Error returned by the obfuscation endpoints
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Body could not be read, e.g. over the size limit
    #[error("{}", .0.body_text())]
    Body(#[from] BytesRejection),

    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Body(rejection) => rejection.status(),
            ApiError::Obfuscation(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            ApiError::Obfuscation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain text response for the raw text endpoint
    pub fn into_plain_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// JSON body `{"success": false, "error": "..."}`
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ObfuscationResult::failure(self.to_string()))).into_response()
    }
}
