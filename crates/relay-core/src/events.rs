// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process publish/subscribe for gateway events
//!
//! Every subscriber owns an unbounded queue, so a slow HTTP client never makes
//! another run miss events. Subscriptions deregister explicitly through
//! [`Subscription::unsubscribe`] or implicitly on drop.

use crate::protocol::{AgentEvent, EventFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Event delivered to bus subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Normalized `agent` event
    Agent(AgentEvent),
    /// Any other server push, forwarded untouched
    Other(EventFrame),
    /// The socket went away; runs bound to it will see no further events
    ConnectionLost,
}

struct BusInner<T> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>,
}

impl<T> BusInner<T> {
    fn remove(&self, id: u64) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }
}

pub struct EventBus<T = GatewayEvent> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that sees every event published from now on
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_listeners().insert(id, tx);
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Deliver `event` to every current listener; returns how many received it
    pub fn publish(&self, event: T) -> usize {
        let mut listeners = self.lock_listeners();
        listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        listeners.len()
    }
}

impl<T> EventBus<T> {
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<T>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one listener on an [`EventBus`]
pub struct Subscription<T = GatewayEvent> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Weak<BusInner<T>>,
    active: bool,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once unsubscribed (after draining) or the bus is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove this listener from the bus. Returns `true` only for the call
    /// that actually removed it.
    pub fn unsubscribe(&mut self) -> bool {
        if !std::mem::replace(&mut self.active, false) {
            return false;
        }
        self.rx.close();
        match self.bus.upgrade() {
            Some(bus) => bus.remove(self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
