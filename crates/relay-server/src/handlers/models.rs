// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `GET /v1/models`

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
}

/// Advertise the default agent under the model prefix
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let relay = &state.config().relay;
    Json(ModelList {
        object: "list",
        data: vec![ModelEntry {
            id: format!("{}:{}", relay.model_prefix, relay.default_agent_id),
            object: "model",
            created: 0,
            owned_by: relay.model_prefix.clone(),
        }],
    })
}
