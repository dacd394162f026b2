// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Correlation of outbound requests with their responses

use crate::error::{RelayError, RelayResult};
use crate::protocol::ResponseFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type Resolver = oneshot::Sender<RelayResult<Value>>;

/// In-flight requests keyed by frame id
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, Resolver>>,
}

impl PendingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `id` and get the guard that awaits its response. The entry is
    /// removed when the guard settles or is dropped.
    pub fn register(self: &Arc<Self>, id: impl Into<String>) -> PendingGuard {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        PendingGuard {
            id,
            pending: Arc::clone(self),
            rx: Some(rx),
        }
    }

    /// Settle the request matching `frame.id`. Returns `false` for unknown ids.
    pub fn resolve(&self, frame: ResponseFrame) -> bool {
        let Some(tx) = self.lock().remove(&frame.id) else {
            return false;
        };
        let result = if frame.ok {
            Ok(frame.payload.unwrap_or(Value::Null))
        } else {
            let error = frame.error.unwrap_or_default();
            Err(RelayError::Remote {
                code: error.code,
                message: error.message.unwrap_or_else(|| "request failed".to_string()),
            })
        };
        // Receiver may already be gone (caller timed out or was dropped)
        let _ = tx.send(result);
        true
    }

    /// Fail every in-flight request, e.g. on connection loss
    pub fn reject_all(&self, error: impl Fn() -> RelayError) -> usize {
        let drained: Vec<Resolver> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Resolver>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Awaits one response; deregisters on every exit path
pub struct PendingGuard {
    id: String,
    pending: Arc<PendingRequests>,
    rx: Option<oneshot::Receiver<RelayResult<Value>>>,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self, method: &str, timeout: Duration) -> RelayResult<Value> {
        let Some(rx) = self.rx.take() else {
            return Err(RelayError::ConnectionClosed);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(method, request_id = %self.id, timeout_ms = timeout.as_millis() as u64, "Gateway request timed out");
                Err(RelayError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
