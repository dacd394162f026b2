// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent Relay HTTP server
//!
//! Exposes an OpenAI-compatible chat completions API (buffered JSON and SSE)
//! on top of the persistent agent runtime channel provided by `relay-core`.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::{ServerError, ServerResult};
pub use server::Server;
pub use state::AppState;
