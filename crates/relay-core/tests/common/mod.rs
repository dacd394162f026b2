// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_core::config::GatewayConfig;
use relay_core::mock_gateway::{MockGateway, MockGatewayOptions};
use relay_core::{Ed25519DeviceIdentity, GatewayClient};

/// Gateway settings tuned for fast tests against `mock`.
pub fn fast_config(mock: &MockGateway) -> GatewayConfig {
    GatewayConfig {
        url: mock.url(),
        handshake_timeout_ms: 500,
        request_timeout_ms: 1_000,
        reconnect_base_ms: 20,
        reconnect_max_ms: 100,
        ..GatewayConfig::default()
    }
}

pub fn client(config: GatewayConfig) -> GatewayClient {
    GatewayClient::new(config, Arc::new(Ed25519DeviceIdentity::generate()))
}

/// Spawn a mock runtime and a started client connected to it.
pub async fn connected_pair(
    options: MockGatewayOptions,
    configure: impl FnOnce(&mut GatewayConfig),
) -> (MockGateway, GatewayClient) {
    let mock = MockGateway::start_with(options).await.expect("mock gateway");
    let mut config = fast_config(&mock);
    configure(&mut config);
    let client = client(config);
    client.start();
    assert!(
        client.wait_until_connected(Duration::from_secs(5)).await,
        "client should connect to the mock gateway"
    );
    (mock, client)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
