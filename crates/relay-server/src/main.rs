// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent Relay server binary

use clap::Parser;
use relay_core::{Ed25519DeviceIdentity, RelayConfig, SessionMode};
use relay_logging::CliLoggingArgs;
use relay_server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "AGENT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for the HTTP server (overrides server.bind_addr)
    #[arg(short, long)]
    bind: Option<String>,

    /// Agent runtime WebSocket URL (overrides gateway.url)
    #[arg(long)]
    gateway_url: Option<String>,

    /// stateful or passthrough (overrides relay.session_mode)
    #[arg(long)]
    session_mode: Option<SessionMode>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn apply_overrides(&self, config: &mut RelayConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_addr = bind.clone();
        }
        if let Some(url) = &self.gateway_url {
            config.gateway.url = url.clone();
        }
        if let Some(mode) = self.session_mode {
            config.relay.session_mode = mode;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.logging.clone().init("agent-relay")?;

    let mut config = RelayConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;
    tracing::info!(
        bind = %config.server.bind_addr,
        gateway = %config.gateway.url,
        session_mode = %config.relay.session_mode,
        "Configuration loaded"
    );

    let identity =
        Ed25519DeviceIdentity::load_or_generate(config.gateway.device_key_path.as_deref())?;
    let server = Server::new(config, Arc::new(identity))?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    server.run().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
