// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server state management

use relay_core::{ChatRelay, DeviceSigner, GatewayClient, RelayConfig, SessionRegistry};
use std::sync::Arc;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    /// Orchestrates runs for incoming chat requests
    pub relay: ChatRelay,

    /// The single persistent channel to the agent runtime
    pub gateway: GatewayClient,

    pub sessions: Arc<SessionRegistry>,

    pub config: Arc<RelayConfig>,
}

impl AppState {
    /// Wire the gateway client, session registry and relay together.
    /// The gateway is not started here.
    pub fn new(config: RelayConfig, signer: Arc<dyn DeviceSigner>) -> Self {
        let gateway = GatewayClient::new(config.gateway.clone(), signer);
        let sessions = Arc::new(SessionRegistry::new(&config.relay));
        let relay = ChatRelay::new(
            Arc::new(gateway.clone()),
            Arc::clone(&sessions),
            config.relay.clone(),
        );
        Self {
            relay,
            gateway,
            sessions,
            config: Arc::new(config),
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}
