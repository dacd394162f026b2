// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server error types and their OpenAI-style JSON bodies

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_core::RelayError;
use serde::Serialize;

/// Server result type
pub type ServerResult<T> = Result<T, ServerError>;

/// Server error types
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("The model '{0}' does not exist")]
    ModelNotFound(String),

    #[error("Agent gateway is not connected")]
    GatewayUnavailable,

    #[error("Agent gateway did not answer in time: {0}")]
    GatewayTimeout(String),

    #[error("Agent run timed out after {0}ms")]
    RunTimeout(u64),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// `{"error": {...}}` envelope used by OpenAI-compatible clients
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: Option<&'static str>,
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServerError::RunTimeout(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Convert error to the OpenAI error envelope
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let (kind, code) = match self {
            ServerError::BadRequest(_) => ("invalid_request_error", None),
            ServerError::Unauthorized(_) => ("authentication_error", Some("invalid_api_key")),
            ServerError::ModelNotFound(_) => ("invalid_request_error", Some("model_not_found")),
            ServerError::GatewayUnavailable => ("server_error", Some("gateway_unavailable")),
            ServerError::GatewayTimeout(_) => ("server_error", Some("gateway_timeout")),
            ServerError::RunTimeout(_) => ("server_error", Some("run_timeout")),
            ServerError::Internal(_) => ("server_error", None),
        };
        ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                kind,
                code,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        }
        (self.status(), Json(self.to_envelope())).into_response()
    }
}

impl From<RelayError> for ServerError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::UnknownAgent { agent_id } => ServerError::ModelNotFound(agent_id),
            RelayError::NotConnected | RelayError::ConnectionClosed => {
                ServerError::GatewayUnavailable
            }
            RelayError::RequestTimeout { method, timeout_ms } => {
                ServerError::GatewayTimeout(format!("{method} after {timeout_ms}ms"))
            }
            RelayError::RunTimeout { timeout_ms } => ServerError::RunTimeout(timeout_ms),
            RelayError::InvalidRequest { message } => ServerError::BadRequest(message),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

/// Convert any error to ServerError
impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

/// Convert IO errors
impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(format!("IO error: {}", err))
    }
}
