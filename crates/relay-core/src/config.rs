// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the agent relay
//!
//! Values are layered from lowest to highest precedence: built-in defaults,
//! an optional YAML file, `AGENT_RELAY__SECTION__KEY` environment variables.
//! CLI overrides are applied by the binary on top of the loaded value.

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "AGENT_RELAY";

/// Highest gateway protocol revision this relay speaks
pub const PROTOCOL_VERSION: u32 = 3;

/// Main configuration structure for the agent relay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP surface configuration
    pub server: ServerConfig,

    /// Agent runtime connection configuration
    pub gateway: GatewayConfig,

    /// Run and session behaviour
    pub relay: RunConfig,
}

/// HTTP surface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Bearer key required on `/v1/*` when set
    pub api_key: Option<String>,

    /// Enable permissive CORS
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:18790".to_string(),
            api_key: None,
            enable_cors: true,
        }
    }
}

/// Agent runtime connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the agent runtime
    pub url: String,

    /// Shared bearer token presented during the handshake
    pub token: Option<String>,

    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,

    pub min_protocol: u32,
    pub max_protocol: u32,

    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// First reconnect delay; doubles per consecutive failure
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Hex-encoded ed25519 secret key; an ephemeral key is generated when unset
    pub device_key_path: Option<PathBuf>,

    /// Treat an explicit handshake rejection as terminal instead of retrying
    pub stop_on_handshake_rejection: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            client_id: "gateway-client".to_string(),
            client_mode: "backend".to_string(),
            role: "operator".to_string(),
            scopes: vec![
                "operator.read".to_string(),
                "operator.write".to_string(),
                "operator.approvals".to_string(),
            ],
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            handshake_timeout_ms: 15_000,
            request_timeout_ms: 30_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            device_key_path: None,
            stop_on_handshake_rejection: false,
        }
    }
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How conversation context is forwarded to the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// The runtime keeps history; only the latest user turn is sent
    #[default]
    Stateful,
    /// Every request carries the whole transcript
    Passthrough,
}

impl FromStr for SessionMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stateful" => Ok(SessionMode::Stateful),
            "passthrough" => Ok(SessionMode::Passthrough),
            other => Err(RelayError::config(format!(
                "unknown session mode '{other}' (expected stateful or passthrough)"
            ))),
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Stateful => write!(f, "stateful"),
            SessionMode::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Run and session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub session_mode: SessionMode,
    pub default_agent_id: String,
    pub default_user: String,
    pub model_prefix: String,

    /// Upper bound on a buffered (non-streaming) completion
    pub run_timeout_ms: u64,

    /// Send `chat.abort` upstream when a client goes away mid-run
    pub abort_on_disconnect: bool,

    pub session_ttl_secs: u64,
    pub approval_ttl_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            session_mode: SessionMode::Stateful,
            default_agent_id: "main".to_string(),
            default_user: "default".to_string(),
            model_prefix: "openclaw".to_string(),
            run_timeout_ms: 60_000,
            abort_on_disconnect: false,
            session_ttl_secs: 24 * 60 * 60,
            approval_ttl_secs: 60 * 60,
            maintenance_interval_secs: 60 * 60,
        }
    }
}

impl RunConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl RelayConfig {
    /// Load configuration from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`RelayConfig::load`], but reads overrides from `env` instead of
    /// the process environment when provided.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> RelayResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(RelayError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Yaml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("gateway.scopes")
                .source(env),
        );

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string (no environment overlay)
    pub fn from_yaml_str(yaml: &str) -> RelayResult<Self> {
        let config: RelayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> RelayResult<()> {
        let gateway = &self.gateway;

        if gateway.url.trim().is_empty() {
            return Err(RelayError::config("gateway.url must not be empty"));
        }
        let url = url::Url::parse(&gateway.url)
            .map_err(|e| RelayError::config(format!("invalid gateway.url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RelayError::config(format!(
                "gateway.url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if gateway.min_protocol > gateway.max_protocol {
            return Err(RelayError::config(format!(
                "gateway.min_protocol ({}) exceeds gateway.max_protocol ({})",
                gateway.min_protocol, gateway.max_protocol
            )));
        }

        for (name, value) in [
            ("gateway.handshake_timeout_ms", gateway.handshake_timeout_ms),
            ("gateway.request_timeout_ms", gateway.request_timeout_ms),
            ("gateway.reconnect_base_ms", gateway.reconnect_base_ms),
            ("relay.run_timeout_ms", self.relay.run_timeout_ms),
            ("relay.maintenance_interval_secs", self.relay.maintenance_interval_secs),
        ] {
            if value == 0 {
                return Err(RelayError::config(format!("{name} must be greater than zero")));
            }
        }

        if gateway.reconnect_base_ms > gateway.reconnect_max_ms {
            return Err(RelayError::config(format!(
                "gateway.reconnect_base_ms ({}) exceeds gateway.reconnect_max_ms ({})",
                gateway.reconnect_base_ms, gateway.reconnect_max_ms
            )));
        }

        if self.relay.default_agent_id.trim().is_empty() {
            return Err(RelayError::config("relay.default_agent_id must not be empty"));
        }

        Ok(())
    }
}
