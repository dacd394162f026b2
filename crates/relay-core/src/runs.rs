// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Binding of asynchronous agent events to the request that started a run
//!
//! The runtime may push events for a run before the `agent` response that
//! names its `runId` arrives. A handle therefore subscribes before issuing
//! the run and locks onto the first run id seen for its session key.

use crate::connection::GatewayRpc;
use crate::error::{RelayError, RelayResult};
use crate::events::{GatewayEvent, Subscription};
use crate::protocol::{AgentEvent, METHOD_AGENT, METHOD_APPROVAL_RESOLVE, METHOD_CHAT_ABORT};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Which events belong to one run
#[derive(Debug, Clone)]
pub struct RunBinding {
    session_key: String,
    run_id: Option<String>,
    locked_at: Option<Instant>,
}

impl RunBinding {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_id: None,
            locked_at: None,
        }
    }

    /// Binding for a run whose id is already known (approval resumption)
    pub fn locked(session_key: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            run_id: Some(run_id.into()),
            locked_at: Some(Instant::now()),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn locked_at(&self) -> Option<Instant> {
        self.locked_at
    }

    /// Whether `event` belongs to this run. While unlocked, the first event
    /// for our session key locks the run id it carries.
    pub fn matches(&mut self, event: &AgentEvent) -> bool {
        if let Some(run_id) = &self.run_id {
            return event.run_id.as_deref() == Some(run_id.as_str());
        }
        if event.session_key.as_deref() != Some(self.session_key.as_str()) {
            return false;
        }
        if let Some(run_id) = &event.run_id {
            debug!(run_id = %run_id, session_key = %self.session_key, "Run bound from event");
            self.lock(run_id.clone());
        }
        true
    }

    /// Apply the run id returned by the `agent` response
    pub fn reconcile_issued(&mut self, run_id: &str) -> RelayResult<()> {
        match &self.run_id {
            None => {
                self.lock(run_id.to_string());
                Ok(())
            }
            Some(locked) if locked == run_id => Ok(()),
            Some(locked) => Err(RelayError::protocol(format!(
                "run id mismatch for session {}: events bound {locked}, response returned {run_id}",
                self.session_key
            ))),
        }
    }

    fn lock(&mut self, run_id: String) {
        self.run_id = Some(run_id);
        self.locked_at = Some(Instant::now());
    }
}

/// Parameters of a new run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent_id: String,
    /// Remote session id sent upstream as `sessionKey`
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
}

/// Issues runs and approval resumptions against the gateway
#[derive(Clone)]
pub struct RunCorrelator {
    gateway: Arc<dyn GatewayRpc>,
    abort_on_disconnect: bool,
}

impl RunCorrelator {
    pub fn new(gateway: Arc<dyn GatewayRpc>, abort_on_disconnect: bool) -> Self {
        Self {
            gateway,
            abort_on_disconnect,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn GatewayRpc> {
        &self.gateway
    }

    /// Start a new run and return a handle receiving its events
    pub async fn start(&self, request: RunRequest) -> RelayResult<RunHandle> {
        if !self.gateway.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let mut handle = self.handle(RunBinding::new(&request.session_key));

        let params = json!({
            "message": request.message,
            "agentId": request.agent_id,
            "sessionKey": request.session_key,
            "idempotencyKey": request.idempotency_key,
            "deliver": false,
        });
        let payload = match self.gateway.call(METHOD_AGENT, params, None).await {
            Ok(payload) => payload,
            Err(e) => {
                handle.finish();
                return Err(map_agent_error(e, &request.agent_id));
            }
        };

        let issued = payload.get("runId").and_then(Value::as_str);
        if let Err(e) = handle.bind_early(issued) {
            error!(error = %e, session_key = %request.session_key, "Run correlation violated");
            handle.finish();
            self.gateway.reset("run id mismatch");
            return Err(e);
        }
        debug!(run_id = ?handle.run_id(), session_key = %request.session_key, agent_id = %request.agent_id, "Run started");
        Ok(handle)
    }

    /// Approve a paused run and resume listening to it
    pub async fn resume(
        &self,
        session_key: &str,
        run_id: &str,
        approval_id: Option<&str>,
    ) -> RelayResult<RunHandle> {
        if !self.gateway.is_connected() {
            return Err(RelayError::NotConnected);
        }
        let mut handle = self.handle(RunBinding::locked(session_key, run_id));
        let params = json!({
            "requestId": approval_id.unwrap_or(run_id),
            "runId": run_id,
            "sessionKey": session_key,
            "approved": true,
            "decision": "approve",
        });
        if let Err(e) = self.gateway.call(METHOD_APPROVAL_RESOLVE, params, None).await {
            handle.finish();
            return Err(e);
        }
        debug!(run_id, session_key, "Run resumed after approval");
        Ok(handle)
    }

    fn handle(&self, binding: RunBinding) -> RunHandle {
        RunHandle {
            subscription: self.gateway.subscribe(),
            binding,
            queued: VecDeque::new(),
            lost: false,
            finished: false,
            gateway: Arc::clone(&self.gateway),
            abort_on_disconnect: self.abort_on_disconnect,
        }
    }
}

fn map_agent_error(err: RelayError, agent_id: &str) -> RelayError {
    match err {
        RelayError::Remote { code, message }
            if matches!(code.as_deref(), Some("NOT_FOUND" | "UNKNOWN_AGENT"))
                || message.to_ascii_lowercase().contains("unknown agent") =>
        {
            RelayError::UnknownAgent {
                agent_id: agent_id.to_string(),
            }
        }
        other => other,
    }
}

/// Listener for one run. Deregisters from the bus exactly once: on a terminal
/// signal, on [`RunHandle::finish`], or when dropped.
pub struct RunHandle {
    subscription: Subscription<GatewayEvent>,
    binding: RunBinding,
    queued: VecDeque<AgentEvent>,
    /// Connection dropped before the queued events were consumed
    lost: bool,
    finished: bool,
    gateway: Arc<dyn GatewayRpc>,
    abort_on_disconnect: bool,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("binding", &self.binding)
            .field("queued", &self.queued.len())
            .field("lost", &self.lost)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn run_id(&self) -> Option<&str> {
        self.binding.run_id()
    }

    pub fn session_key(&self) -> &str {
        self.binding.session_key()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event of this run in arrival order. Returns `None` once the run
    /// has finished, the connection dropped, or the bus is gone.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        if self.finished {
            return None;
        }
        let event = match self.queued.pop_front() {
            Some(event) => event,
            None if self.lost => {
                warn!(run_id = ?self.binding.run_id(), "Gateway connection lost before run started");
                self.finish();
                return None;
            }
            None => loop {
                match self.subscription.recv().await? {
                    GatewayEvent::Agent(event) => {
                        if self.binding.matches(&event) {
                            break event;
                        }
                    }
                    GatewayEvent::ConnectionLost => {
                        warn!(run_id = ?self.binding.run_id(), "Gateway connection lost mid-run");
                        self.finish();
                        return None;
                    }
                    GatewayEvent::Other(_) => {}
                }
            },
        };
        if event.signal.as_ref().is_some_and(|signal| signal.is_terminal()) {
            self.finish();
        }
        Some(event)
    }

    /// Stop listening. Returns `true` only for the call that deregistered.
    pub fn finish(&mut self) -> bool {
        self.finished = true;
        self.subscription.unsubscribe()
    }

    /// Bind events that raced ahead of the `agent` response, then lock the
    /// issued run id. Events carrying only a run id are held in arrival order
    /// until the lock decides whether they belong to this run.
    fn bind_early(&mut self, issued_run_id: Option<&str>) -> RelayResult<()> {
        let mut early = Vec::new();
        while let Some(event) = self.subscription.try_recv() {
            match event {
                GatewayEvent::Agent(event) => {
                    let matched = self.binding.matches(&event);
                    early.push((event, matched));
                }
                GatewayEvent::ConnectionLost => {
                    self.lost = true;
                    break;
                }
                GatewayEvent::Other(_) => {}
            }
        }

        if let Some(run_id) = issued_run_id {
            self.binding.reconcile_issued(run_id)?;
        }

        for (event, matched) in early {
            let same_run =
                event.run_id.is_some() && event.run_id.as_deref() == self.binding.run_id();
            if matched || same_run {
                self.queued.push_back(event);
            }
        }
        Ok(())
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.finish() {
            return;
        }
        if !self.abort_on_disconnect {
            return;
        }
        let Some(run_id) = self.binding.run_id().map(str::to_string) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        let session_key = self.binding.session_key().to_string();
        debug!(run_id = %run_id, session_key = %session_key, "Client went away, aborting run");
        runtime.spawn(async move {
            let params = json!({ "sessionKey": session_key, "runId": run_id });
            if let Err(e) = gateway.call(METHOD_CHAT_ABORT, params, None).await {
                warn!(error = %e, run_id = %run_id, "Best-effort run abort failed");
            }
        });
    }
}
