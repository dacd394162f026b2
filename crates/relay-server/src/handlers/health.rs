// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Health check endpoints

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use relay_core::ConnectionState;
use serde::Serialize;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub gateway: ConnectionState,
    pub sessions: usize,
    pub timestamp: String,
}

/// Liveness: the process is up
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Readiness: the agent runtime channel is authenticated
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let gateway = state.gateway.state();
    let (status, label) = if gateway == ConnectionState::Connected {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        status,
        Json(ReadinessResponse {
            status: label.to_string(),
            gateway,
            sessions: state.sessions.session_count(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
