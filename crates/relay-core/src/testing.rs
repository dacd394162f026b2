// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory [`GatewayRpc`] for unit tests

use crate::connection::GatewayRpc;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, GatewayEvent, Subscription};
use crate::protocol::{AgentEvent, DeltaPayload, RunSignal};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = dyn Fn(&str, &Value, &EventBus<GatewayEvent>) -> RelayResult<Value> + Send + Sync;

pub struct FakeGateway {
    pub bus: EventBus<GatewayEvent>,
    calls: Mutex<Vec<(String, Value)>>,
    resets: Mutex<Vec<String>>,
    connected: AtomicBool,
    responder: Box<Responder>,
}

impl FakeGateway {
    /// Every `agent` call answers with `runId`; other methods answer `{}`
    pub fn with_run_id(run_id: &str) -> Arc<Self> {
        let run_id = run_id.to_string();
        Self::with_responder(move |method, _, _| match method {
            "agent" => Ok(json!({ "runId": run_id })),
            _ => Ok(json!({})),
        })
    }

    pub fn with_responder(
        responder: impl Fn(&str, &Value, &EventBus<GatewayEvent>) -> RelayResult<Value>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus: EventBus::new(),
            calls: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            responder: Box::new(responder),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }

    pub fn resets(&self) -> Vec<String> {
        self.resets.lock().unwrap().clone()
    }

    pub fn emit(&self, event: AgentEvent) {
        self.bus.publish(GatewayEvent::Agent(event));
    }
}

#[async_trait]
impl GatewayRpc for FakeGateway {
    async fn call(
        &self,
        method: &str,
        params: Value,
        _timeout: Option<Duration>,
    ) -> RelayResult<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.responder)(method, &params, &self.bus)
    }

    fn subscribe(&self) -> Subscription<GatewayEvent> {
        self.bus.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reset(&self, reason: &str) {
        self.resets.lock().unwrap().push(reason.to_string());
    }
}

pub fn delta_event(run_id: &str, delta: DeltaPayload) -> AgentEvent {
    AgentEvent {
        run_id: Some(run_id.to_string()),
        delta: Some(delta),
        ..Default::default()
    }
}

pub fn signal_event(run_id: &str, signal: RunSignal) -> AgentEvent {
    AgentEvent {
        run_id: Some(run_id.to_string()),
        signal: Some(signal),
        ..Default::default()
    }
}
