use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chabito::errors::AgentError;
use serde_json::{json, Value};
use thiserror::Error;

use crate::payload::PayloadError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {env_var}")]
    MissingEnvVar { env_var: String },

    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// Environment variable that sets the dotted configuration key `field`
pub fn to_env_var(field: &str) -> String {
    // Nested fields are reported either fully dotted or by their leaf name only
    let path = match field {
        "provider" | "type" => "provider.type".to_string(),
        "api_key" => "provider.api_key".to_string(),
        other => other.to_string(),
    };
    format!("CHABITO_{}", path.replace('.', "__").to_uppercase())
}

/// Failure of a request, rendered as `{error, detail}` with a matching status
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Payload(PayloadError::InvalidJson) => StatusCode::BAD_REQUEST,
            ApiError::Payload(PayloadError::InvalidPayload(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Agent(err) => match err {
                AgentError::UnknownTool(_) | AgentError::InvalidParameters(_) => {
                    StatusCode::BAD_REQUEST
                }
                AgentError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                AgentError::ModelInvocation(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ApiError::Payload(err) => err.to_json(),
            ApiError::Agent(err) => json!({
                "error": err.code(),
                "detail": err.to_string(),
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_json())).into_response()
    }
}
