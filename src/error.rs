//! Error types shared by the registries, the router and the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::identity::IdentityError;
use crate::models::ErrorBody;

/// Gateway-level error
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("client connection not found: {0}")]
    ClientNotFound(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("{0} queue is full")]
    QueueFull(&'static str),

    #[error("endpoint {endpoint} unavailable: {reason}")]
    DownstreamUnavailable { endpoint: String, reason: String },

    #[error("identity lookup failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ClientNotFound(_) | GatewayError::StreamNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DownstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Identity(_) => StatusCode::BAD_GATEWAY,
            GatewayError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            status: "error".to_string(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(
            GatewayError::StreamNotFound("s1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::QueueFull("frame").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::MalformedInput("missing camera_id".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::FrameTooLarge { size: 11, max: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        let err: GatewayError = IdentityError::NotFound("c1".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
