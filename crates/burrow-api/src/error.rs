//! Mapping of tunnel failures onto HTTP responses

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use burrow_proto::TunnelError;
use serde::{Deserialize, Serialize};

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    /// Human readable message
    pub error: String,
    /// The typed failure, decoded back into a `TunnelError` by the client
    pub detail: TunnelError,
}

/// Handler error wrapping a `TunnelError`
#[derive(Debug)]
pub struct ApiError(pub TunnelError);

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(TunnelError::Protocol {
            message: rejection.body_text(),
        })
    }
}

pub fn status_for(err: &TunnelError) -> StatusCode {
    match err {
        TunnelError::Authentication { .. } => StatusCode::UNAUTHORIZED,
        TunnelError::UnknownSession { .. } => StatusCode::NOT_FOUND,
        TunnelError::UnknownConnection { .. } => StatusCode::NOT_FOUND,
        TunnelError::TargetUnreachable { .. } => StatusCode::BAD_GATEWAY,
        TunnelError::ConnectionClosed { .. } => StatusCode::GONE,
        TunnelError::BufferFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        TunnelError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        TunnelError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        TunnelError::Transport { .. } | TunnelError::NotSent { .. } => StatusCode::BAD_GATEWAY,
        TunnelError::Protocol { .. } => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.to_string(),
            detail: self.0,
        };
        (status, Json(body)).into_response()
    }
}
