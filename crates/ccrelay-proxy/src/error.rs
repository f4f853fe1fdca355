//! Proxy error types

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no proxyable endpoints: every profile is disabled or missing a base URL, credential or model")]
    NoProxyableEndpoints,

    #[error("endpoint '{endpoint}' names unknown transformer '{transformer}'")]
    UnknownTransformer {
        endpoint: String,
        transformer: String,
    },

    #[error("endpoint '{endpoint}' has an invalid base URL: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("port {port} is in use by another process")]
    PortInUse { port: u16 },

    #[error("running proxy at {url} is not answering: {message}")]
    Unresponsive { url: String, message: String },

    #[error("missing or invalid proxy credential")]
    Unauthorized,

    #[error("no upstream endpoint is currently available")]
    NoEndpointAvailable,

    #[error("upstream '{endpoint}' unavailable: {message}")]
    UpstreamUnavailable { endpoint: String, message: String },

    #[error("transformation failed: {0}")]
    Transform(#[from] TransformError),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Startup errors that must stop the proxy before it binds its port.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoProxyableEndpoints | Self::UnknownTransformer { .. } | Self::InvalidEndpoint { .. }
        )
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::BadRequest(_) => "invalid_request_error",
            Self::NoEndpointAvailable => "overloaded_error",
            _ => "api_error",
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoEndpointAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable { .. } | Self::Transform(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic-shaped error body so the assistant renders it natively.
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }))
    }
}

/// Request/response shape mismatch between the assistant and a provider.
///
/// Never bans an endpoint: it is a protocol problem, not a reachability one.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("unexpected upstream response: {0}")]
    InvalidResponse(String),

    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProxyError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProxyError::NoEndpointAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::UpstreamUnavailable {
                endpoint: "a".into(),
                message: "timeout".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::from(TransformError::InvalidResponse("x".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_configuration_classification() {
        assert!(ProxyError::NoProxyableEndpoints.is_configuration());
        assert!(ProxyError::UnknownTransformer {
            endpoint: "a".into(),
            transformer: "nope".into()
        }
        .is_configuration());
        assert!(!ProxyError::PortInUse { port: 1 }.is_configuration());
    }
}
