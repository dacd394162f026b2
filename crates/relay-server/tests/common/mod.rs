// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_core::mock_gateway::MockGateway;
use relay_core::{Ed25519DeviceIdentity, RelayConfig};
use relay_server::Server;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A relay server on an ephemeral port, optionally backed by a mock runtime
pub struct TestServer {
    pub base_url: String,
    pub http: reqwest::Client,
    mock: Option<MockGateway>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Fast reconnect and timeout settings pointed at `gateway_url`
pub fn test_config(gateway_url: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.gateway.url = gateway_url.to_string();
    config.gateway.handshake_timeout_ms = 500;
    config.gateway.request_timeout_ms = 2_000;
    config.gateway.reconnect_base_ms = 20;
    config.gateway.reconnect_max_ms = 100;
    config.relay.run_timeout_ms = 5_000;
    config
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start against a fresh mock runtime and wait until `/readyz` passes
    pub async fn start_with(configure: impl FnOnce(&mut RelayConfig)) -> Self {
        let mock = MockGateway::start().await.expect("mock gateway");
        let mut config = test_config(&mock.url());
        configure(&mut config);

        let server = Self::spawn(config, Some(mock)).await;
        assert!(
            server.wait_ready(Duration::from_secs(10)).await,
            "relay server did not become ready at {}",
            server.base_url
        );
        server
    }

    /// Start a server for `config` without waiting for the gateway
    pub async fn spawn(config: RelayConfig, mock: Option<MockGateway>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let addr = listener.local_addr().expect("port");

        let server =
            Server::new(config, Arc::new(Ed25519DeviceIdentity::generate())).expect("server");
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(async move {
            server.serve(listener).await.expect("server run");
        });

        Self {
            base_url: format!("http://{addr}"),
            http: reqwest::Client::new(),
            mock,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn mock(&self) -> &MockGateway {
        self.mock.as_ref().expect("server started without a mock gateway")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(response) = self.http.get(self.url("/readyz")).send().await {
                if response.status().is_success() {
                    return true;
                }
            }
            if tokio::time::Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancel the server and wait for it to drain
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("server shut down in time")
                .expect("server task");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
