// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Persistent, authenticated channel to the agent runtime
//!
//! A single supervisor task owns the socket for the lifetime of the process:
//! it connects, answers the `connect.challenge` with a signed `connect`
//! request, then pumps frames until the socket goes away, and finally
//! schedules the next attempt with exponential backoff.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingChallenge -> Authenticating -> Connected
//!      ^                                                                  |
//!      +----------------------- close / error / reset --------------------+
//! ```

pub mod pending;

use crate::config::GatewayConfig;
use crate::device::{AuthPayload, DeviceSigner};
use crate::error::{RelayError, RelayResult};
use crate::events::{EventBus, GatewayEvent, Subscription};
use crate::protocol::{
    AgentEvent, AuthParams, ChallengePayload, ClientInfo, ConnectParams, DeviceParams,
    EventFrame, Frame, RequestFrame, EVENT_AGENT, EVENT_CONNECT_CHALLENGE, METHOD_CONNECT,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use pending::{PendingGuard, PendingRequests};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingChallenge => "awaiting_challenge",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Delay before reconnect attempt `attempt` (zero-based): `min(base * 2^attempt, cap)`
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// What run orchestration needs from the gateway channel
#[async_trait]
pub trait GatewayRpc: Send + Sync {
    /// Issue a request; `None` uses the configured default timeout
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>)
        -> RelayResult<Value>;

    fn subscribe(&self) -> Subscription<GatewayEvent>;

    fn is_connected(&self) -> bool;

    /// Drop the current socket so the supervisor reconnects
    fn reset(&self, reason: &str);
}

/// Handle to the gateway connection; cheap to clone
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: GatewayConfig,
    signer: Arc<dyn DeviceSigner>,
    state: watch::Sender<ConnectionState>,
    pending: Arc<PendingRequests>,
    events: EventBus<GatewayEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    session: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig, signer: Arc<dyn DeviceSigner>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                signer,
                state,
                pending: PendingRequests::new(),
                events: EventBus::new(),
                outbound: Mutex::new(None),
                session: Mutex::new(None),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Spawn the supervisor. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut supervisor = lock(&self.shared.supervisor);
        if supervisor.is_some() || self.shared.shutdown.is_cancelled() {
            return;
        }
        info!(url = %self.shared.config.url, "Starting gateway connection supervisor");
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared))));
    }

    /// Cancel any pending reconnect, close the socket and fail in-flight requests.
    /// The client cannot be restarted afterwards.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        self.shared.end_session("stopping");
        let handle = lock(&self.shared.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Gateway supervisor exited abnormally");
            }
        }
        self.shared.pending.reject_all(|| RelayError::ConnectionClosed);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Gateway connection stopped");
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the handshake completes; `false` on timeout
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state_watch();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .is_ok_and(|result| result.is_ok())
    }

    pub async fn request(&self, method: &str, params: Value) -> RelayResult<Value> {
        self.request_with_timeout(method, params, self.shared.config.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RelayResult<Value> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.shared.send_request(method, params, timeout).await
    }

    pub fn events(&self) -> &EventBus<GatewayEvent> {
        &self.shared.events
    }

    pub fn reset(&self, reason: &str) {
        self.shared.end_session(reason);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

#[async_trait]
impl GatewayRpc for GatewayClient {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> RelayResult<Value> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.request_timeout());
        self.request_with_timeout(method, params, timeout).await
    }

    fn subscribe(&self) -> Subscription<GatewayEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        GatewayClient::is_connected(self)
    }

    fn reset(&self, reason: &str) {
        GatewayClient::reset(self, reason)
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Gateway connection state changed");
        }
    }

    /// Send a request on the live socket without checking the connection
    /// state. Used directly by re-authentication.
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RelayResult<Value> {
        let request = RequestFrame::new(method, Some(params));
        let guard = self.pending.register(request.id.clone());
        let text = Frame::Request(request).encode()?;

        let outbound = lock(&self.outbound).clone();
        let Some(tx) = outbound else {
            return Err(RelayError::NotConnected);
        };
        debug!(method, request_id = %guard.id(), "Sending gateway request");
        tx.send(Message::Text(text))
            .map_err(|_| RelayError::ConnectionClosed)?;
        guard.wait(method, timeout).await
    }

    fn connect_params(&self, nonce: Option<&str>) -> RelayResult<ConnectParams> {
        let config = &self.config;
        let device_id = self.signer.device_id();
        let signed_at = chrono::Utc::now().timestamp_millis();
        let payload = AuthPayload {
            device_id: &device_id,
            client_id: &config.client_id,
            client_mode: &config.client_mode,
            role: &config.role,
            scopes: &config.scopes,
            signed_at_ms: signed_at,
            token: config.token.as_deref(),
            nonce,
        };
        let signature = self.signer.sign(&payload.canonical())?;

        Ok(ConnectParams {
            min_protocol: config.min_protocol,
            max_protocol: config.max_protocol,
            client: ClientInfo {
                id: config.client_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: config.client_mode.clone(),
            },
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            caps: Vec::new(),
            auth: config.token.clone().map(|token| AuthParams { token }),
            device: DeviceParams {
                id: device_id,
                public_key: self.signer.public_key(),
                signature,
                signed_at,
                nonce: nonce.map(str::to_string),
            },
        })
    }

    /// Close the current socket, if any. The supervisor notices and reconnects
    /// unless shutdown was requested.
    fn end_session(&self, reason: &str) {
        if let Some(session) = lock(&self.session).take() {
            info!(reason, "Resetting gateway connection");
            session.cancel();
        }
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed gateway frame");
                return;
            }
        };

        match frame {
            Frame::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    debug!(request_id = %id, "Response for unknown or expired request");
                }
            }
            Frame::Event(event) => self.handle_event(event),
            Frame::Request(request) => {
                debug!(method = %request.method, "Ignoring server-initiated request");
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: EventFrame) {
        match event.event.as_str() {
            EVENT_CONNECT_CHALLENGE => match ChallengePayload::from_event(&event) {
                Ok(challenge) => {
                    info!("Gateway re-issued challenge, re-authenticating");
                    tokio::spawn(Arc::clone(self).reauthenticate(challenge.nonce));
                }
                Err(e) => warn!(error = %e, "Dropping malformed challenge"),
            },
            EVENT_AGENT => {
                let payload = event.payload.unwrap_or(Value::Null);
                match AgentEvent::from_payload(&payload) {
                    Ok(agent) => {
                        self.events.publish(GatewayEvent::Agent(agent));
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed agent event"),
                }
            }
            _ => {
                self.events.publish(GatewayEvent::Other(event));
            }
        }
    }

    async fn reauthenticate(self: Arc<Self>, nonce: String) {
        let result = async {
            let params = serde_json::to_value(self.connect_params(Some(&nonce))?)?;
            self.send_request(METHOD_CONNECT, params, self.config.handshake_timeout())
                .await
        }
        .await;

        match result {
            Ok(_) => info!("Re-authenticated with agent gateway"),
            Err(e) => {
                warn!(error = %e, "Re-authentication failed");
                self.end_session("re-authentication failed");
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let base = Duration::from_millis(shared.config.reconnect_base_ms);
    let cap = Duration::from_millis(shared.config.reconnect_max_ms);
    let mut attempt: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match connect_once(&shared).await {
            Ok(()) => {
                attempt = 0;
                info!("Gateway connection closed");
            }
            Err(e) => {
                if e.is_handshake_rejection() && shared.config.stop_on_handshake_rejection {
                    error!(error = %e, "Gateway rejected the handshake, giving up");
                    shared.set_state(ConnectionState::Disconnected);
                    break;
                }
                warn!(error = %e, attempt, "Gateway connection attempt failed");
            }
        }

        let rejected = shared.pending.reject_all(|| RelayError::ConnectionClosed);
        if rejected > 0 {
            debug!(rejected, "Rejected in-flight requests after connection loss");
        }
        shared.set_state(ConnectionState::Disconnected);

        let delay = reconnect_delay(attempt, base, cap);
        attempt = attempt.saturating_add(1);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling gateway reconnect");

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Gateway supervisor exiting");
}

/// One connection lifetime. `Err` when the attempt fails before the
/// handshake completes; `Ok` once an established session has ended.
async fn connect_once(shared: &Arc<Shared>) -> RelayResult<()> {
    shared.set_state(ConnectionState::Connecting);
    debug!(url = %shared.config.url, "Connecting to agent gateway");

    let connected = tokio::select! {
        _ = shared.shutdown.cancelled() => return Ok(()),
        result = tokio::time::timeout(
            shared.config.handshake_timeout(),
            tokio_tungstenite::connect_async(shared.config.url.as_str()),
        ) => result,
    };
    let mut ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return Err(RelayError::connection(e.to_string())),
        Err(_) => return Err(RelayError::connection("timed out opening socket")),
    };

    let timeout = shared.config.handshake_timeout();
    let handshaken = tokio::select! {
        _ = shared.shutdown.cancelled() => None,
        result = tokio::time::timeout(timeout, handshake(shared, &mut ws)) => Some(result),
    };
    match handshaken {
        None => {
            debug!("Handshake abandoned on shutdown");
            let _ = ws.close(None).await;
            return Ok(());
        }
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => {
            let _ = ws.close(None).await;
            return Err(e);
        }
        Some(Err(_)) => {
            let _ = ws.close(None).await;
            return Err(RelayError::Handshake {
                code: None,
                message: format!("handshake timed out after {}ms", timeout.as_millis()),
            });
        }
    }

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session = shared.shutdown.child_token();
    *lock(&shared.outbound) = Some(tx);
    *lock(&shared.session) = Some(session.clone());
    shared.set_state(ConnectionState::Connected);
    info!(url = %shared.config.url, "Connected to agent gateway");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                warn!(error = %e, "Gateway socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Gateway closed the socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Gateway socket read failed");
                    break;
                }
                None => break,
            },
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    shared.events.publish(GatewayEvent::ConnectionLost);
    lock(&shared.session).take();
    if let Some(tx) = lock(&shared.outbound).take() {
        let _ = tx.send(Message::Close(None));
    }
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!("Gateway writer did not finish closing in time");
    }
    Ok(())
}

async fn handshake(shared: &Shared, ws: &mut WsStream) -> RelayResult<()> {
    shared.set_state(ConnectionState::AwaitingChallenge);
    let nonce = loop {
        match read_frame(ws).await? {
            Frame::Event(event) if event.event == EVENT_CONNECT_CHALLENGE => {
                break ChallengePayload::from_event(&event)?.nonce;
            }
            other => debug!(?other, "Ignoring frame while awaiting challenge"),
        }
    };

    shared.set_state(ConnectionState::Authenticating);
    let params = serde_json::to_value(shared.connect_params(Some(&nonce))?)?;
    let request = RequestFrame::new(METHOD_CONNECT, Some(params));
    let request_id = request.id.clone();
    ws.send(Message::Text(Frame::Request(request).encode()?))
        .await?;
    if let Some(token) = shared.config.token.as_deref() {
        debug!(token = %relay_logging::redact(token), "Sent connect request with bearer token");
    }

    loop {
        match read_frame(ws).await? {
            Frame::Response(response) if response.id == request_id => {
                if response.ok {
                    return Ok(());
                }
                let error = response.error.unwrap_or_default();
                return Err(RelayError::Handshake {
                    code: Some(error.code.unwrap_or_else(|| "REJECTED".to_string())),
                    message: error
                        .message
                        .unwrap_or_else(|| "connect rejected".to_string()),
                });
            }
            other => debug!(?other, "Ignoring frame while authenticating"),
        }
    }
}

async fn read_frame(ws: &mut WsStream) -> RelayResult<Frame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                Ok(frame) => return Ok(frame),
                Err(e) => warn!(error = %e, "Dropping malformed gateway frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::connection("socket closed during handshake"));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
