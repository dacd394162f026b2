// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod events;
pub mod mock_gateway;
pub mod protocol;
pub mod reassembler;
pub mod relay;
pub mod runs;
pub mod sessions;

#[cfg(test)]
mod testing;

pub use config::{RelayConfig, SessionMode};
pub use connection::{ConnectionState, GatewayClient, GatewayRpc};
pub use device::{DeviceSigner, Ed25519DeviceIdentity};
pub use error::{RelayError, RelayResult};
pub use events::{EventBus, GatewayEvent, Subscription};
pub use relay::{ChatCompletion, ChatRelay, ChatRequest, ChatStream, StreamItem};
pub use sessions::{ChatMessage, SessionRegistry, CONFIRMATION_NOTICE};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
