use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Failure to acquire or refresh a credential.
///
/// Cloneable so that every caller waiting on a single in-flight refresh can
/// receive the same failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    #[error("Invalid credential configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read credential file: {0}")]
    KeyFile(String),

    #[error("Failed to sign token assertion: {0}")]
    Signing(String),

    #[error("Token endpoint unreachable: {0}")]
    Network(String),

    #[error("Token endpoint rejected the request: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),
}

/// Stable classification surfaced to callers, independent of retry history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ClientError,
    UpstreamUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model '{0}' not found in configuration")]
    ModelNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Upstream rejected the request: {status} - {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("Upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream fault: {0}")]
    UpstreamFault(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamRejected { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error())
                .unwrap_or(StatusCode::BAD_REQUEST),
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamFault(_) => StatusCode::BAD_GATEWAY,
            // nginx's "client closed request"; nobody is usually left to read it
            GatewayError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::JobNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Streaming(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            GatewayError::Config(_) => "configuration_error",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::UpstreamRejected { .. } => "upstream_rejected",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::UpstreamFault(_) => "upstream_fault",
            GatewayError::Cancelled => "request_cancelled",
            GatewayError::JobNotFound(_) => "job_not_found",
            GatewayError::Streaming(_) => "streaming_error",
            GatewayError::Json(_) => "json_error",
            GatewayError::Yaml(_) => "yaml_error",
            GatewayError::Io(_) => "io_error",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::ModelNotFound(_)
            | GatewayError::InvalidRequest(_)
            | GatewayError::UpstreamRejected { .. }
            | GatewayError::Cancelled
            | GatewayError::JobNotFound(_)
            | GatewayError::Json(_) => ErrorClass::ClientError,
            GatewayError::UpstreamUnavailable(_) => ErrorClass::UpstreamUnavailable,
            _ => ErrorClass::Internal,
        }
    }

    /// Message safe to hand to a caller. Internal failures never echo their
    /// detail since it may carry token endpoint responses or file paths.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Internal => match self {
                GatewayError::Auth(_) => "Upstream authentication failed".to_string(),
                GatewayError::UpstreamFault(_) | GatewayError::Streaming(_) => {
                    "Upstream returned an unusable response".to_string()
                }
                _ => "Internal server error".to_string(),
            },
            _ => self.to_string(),
        }
    }

    /// Caller-facing `{error: {type, class, message, code}}` document.
    pub fn to_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.error_type(),
                "class": self.class(),
                "message": self.public_message(),
                "code": self.status_code().as_u16(),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        tracing::error!(
            error_type = error_type,
            status = status.as_u16(),
            message = %self,
            "Request failed"
        );

        (status, Json(self.to_body())).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
