// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the agent relay core

/// Result type alias for operations that can fail
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Main error type for the agent relay core
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Transport-level failure while opening or holding the gateway socket.
    /// Retried by the connection supervisor, never surfaced per call.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The runtime rejected (or never answered) the `connect` handshake
    #[error("Handshake error: {message}")]
    Handshake {
        code: Option<String>,
        message: String,
    },

    #[error("Not connected to the agent gateway")]
    NotConnected,

    #[error("Gateway connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("Gateway error: {message}")]
    Remote {
        code: Option<String>,
        message: String,
    },

    #[error("Run did not complete within {timeout_ms}ms")]
    RunTimeout { timeout_ms: u64 },

    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Device signing error: {message}")]
    Signing { message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("YAML serialization error: {source}")]
    YamlSerialization {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Configuration source error: {source}")]
    ConfigSource {
        #[from]
        source: config::ConfigError,
    },

    #[error("WebSocket error: {source}")]
    WebSocket {
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl From<crate::protocol::ProtocolError> for RelayError {
    fn from(err: crate::protocol::ProtocolError) -> Self {
        RelayError::Protocol {
            message: err.to_string(),
        }
    }
}

impl RelayError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        RelayError::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        RelayError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        RelayError::Config {
            message: message.into(),
        }
    }

    /// Whether this error is a definitive rejection of our credentials, as
    /// opposed to a transport hiccup or a timeout.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(self, RelayError::Handshake { code: Some(_), .. })
    }
}
