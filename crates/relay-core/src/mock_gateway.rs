// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scripted agent runtime for local development and integration tests
//!
//! Speaks the gateway side of the protocol: issues `connect.challenge`,
//! verifies the signed `connect` request, and answers every other request
//! from a replaceable script. The default script echoes the `agent` message
//! back as a streamed reply.

use crate::device::AuthPayload;
use crate::protocol::{
    ConnectParams, EventFrame, Frame, RequestFrame, ResponseFrame, ErrorShape,
    EVENT_AGENT, EVENT_CONNECT_CHALLENGE, METHOD_AGENT, METHOD_CONNECT,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Answer to one scripted request
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    /// `Ok(payload)` or `Err((code, message))`; `None` sends no response
    pub response: Option<Result<Value, (String, String)>>,
    /// `agent` event payloads pushed after the response, in order
    pub events: Vec<Value>,
}

impl MockReply {
    pub fn ok(payload: Value) -> Self {
        Self {
            response: Some(Ok(payload)),
            events: Vec::new(),
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            response: Some(Err((code.to_string(), message.to_string()))),
            events: Vec::new(),
        }
    }

    /// Never answer (exercises request timeouts)
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: Vec<Value>) -> Self {
        self.events = events;
        self
    }
}

type Script = dyn Fn(&str, &Value) -> MockReply + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct MockGatewayOptions {
    /// Reject every `connect` with this `(code, message)`
    pub reject_handshake: Option<(String, String)>,
    /// Never send `connect.challenge`
    pub withhold_challenge: bool,
    /// Require this bearer token in `connect`
    pub expected_token: Option<String>,
}

struct MockState {
    options: MockGatewayOptions,
    script: Mutex<Arc<Script>>,
    requests: Mutex<Vec<RequestFrame>>,
    connections: AtomicUsize,
    handshakes: AtomicUsize,
    live: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(MockGatewayOptions::default()).await
    }

    pub async fn start_with(options: MockGatewayOptions) -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0", options).await
    }

    pub async fn bind(addr: &str, options: MockGatewayOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            options,
            script: Mutex::new(Arc::new(echo_script)),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            handshakes: AtomicUsize::new(0),
            live: Mutex::new(None),
        });

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Mock gateway accepted connection");
                        tokio::spawn(serve(stream, Arc::clone(&accept_state)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Mock gateway accept failed");
                        break;
                    }
                }
            }
        });
        info!(%addr, "Mock gateway listening");

        Ok(Self { addr, state, task })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replace the request script
    pub fn on_request(&self, script: impl Fn(&str, &Value) -> MockReply + Send + Sync + 'static) {
        *lock(&self.state.script) = Arc::new(script);
    }

    /// Params of every request received for `method`, oldest first
    pub fn requests(&self, method: &str) -> Vec<Value> {
        lock(&self.state.requests)
            .iter()
            .filter(|r| r.method == method)
            .map(|r| r.params.clone().unwrap_or(Value::Null))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Successful `connect` handshakes, including re-authentications
    pub fn handshake_count(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Push an event to the live connection; `false` when nobody is connected
    pub fn push_event(&self, event: &str, payload: Value) -> bool {
        send_live(&self.state, event_message(event, payload))
    }

    /// Issue a fresh challenge to the live connection
    pub fn rechallenge(&self) -> bool {
        send_live(&self.state, challenge_message())
    }

    /// Close the live connection from the server side
    pub fn drop_connection(&self) -> bool {
        send_live(&self.state, Message::Close(None))
    }

    /// Send raw text to the live connection
    pub fn send_raw(&self, text: &str) -> bool {
        send_live(&self.state, Message::Text(text.to_string()))
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
        send_live(&self.state, Message::Close(None));
    }
}

/// Default script: `agent` replies with a run id and echoes the message back
fn echo_script(method: &str, params: &Value) -> MockReply {
    if method != METHOD_AGENT {
        return MockReply::ok(json!({}));
    }
    let run_id = format!("run-{}", uuid::Uuid::new_v4().simple());
    let session_key = params["sessionKey"].clone();
    let message = params["message"].as_str().unwrap_or_default().to_string();
    MockReply::ok(json!({ "runId": run_id })).with_events(vec![
        json!({"runId": run_id, "sessionKey": session_key, "stream": "lifecycle", "data": {"phase": "start"}}),
        json!({"runId": run_id, "sessionKey": session_key, "delta": message}),
        json!({"runId": run_id, "sessionKey": session_key, "stream": "lifecycle", "data": {"phase": "end"}}),
    ])
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "Mock gateway WebSocket upgrade failed");
            return;
        }
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *lock(&state.live) = Some(tx.clone());
    if !state.options.withhold_challenge {
        let _ = tx.send(challenge_message());
    }

    let mut nonce: Option<String> = None;
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break };
                if let Message::Text(text) = &message {
                    if let Ok(Frame::Event(EventFrame { event, payload: Some(payload), .. })) = Frame::decode(text) {
                        if event == EVENT_CONNECT_CHALLENGE {
                            nonce = payload["nonce"].as_str().map(str::to_string);
                        }
                    }
                }
                let closing = matches!(message, Message::Close(_));
                if ws.send(message).await.is_err() || closing {
                    break;
                }
            }
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let Ok(Frame::Request(request)) = Frame::decode(&text) else {
                    continue;
                };
                lock(&state.requests).push(request.clone());

                let outgoing = if request.method == METHOD_CONNECT {
                    vec![connect_response(&state, &request, nonce.as_deref())]
                } else {
                    let script = Arc::clone(&*lock(&state.script));
                    let reply = script(&request.method, request.params.as_ref().unwrap_or(&Value::Null));
                    scripted_messages(&request, reply)
                };
                for message in outgoing {
                    let _ = tx.send(message);
                }
            }
        }
    }

    let _ = ws.close(None).await;
    let mut live = lock(&state.live);
    if live.as_ref().is_some_and(|current| current.same_channel(&tx)) {
        *live = None;
    }
}

fn connect_response(state: &MockState, request: &RequestFrame, nonce: Option<&str>) -> Message {
    let verdict = match &state.options.reject_handshake {
        Some((code, message)) => Err((code.clone(), message.clone())),
        None => verify_connect(request, nonce, state.options.expected_token.as_deref()),
    };
    let frame = match verdict {
        Ok(()) => {
            state.handshakes.fetch_add(1, Ordering::SeqCst);
            response(&request.id, Ok(json!({"protocol": 3})))
        }
        Err(error) => response(&request.id, Err(error)),
    };
    text_message(&frame)
}

fn verify_connect(
    request: &RequestFrame,
    nonce: Option<&str>,
    expected_token: Option<&str>,
) -> Result<(), (String, String)> {
    let invalid = |message: &str| ("INVALID_REQUEST".to_string(), message.to_string());
    let params: ConnectParams =
        serde_json::from_value(request.params.clone().unwrap_or(Value::Null))
            .map_err(|e| invalid(&format!("bad connect params: {e}")))?;

    let token = params.auth.as_ref().map(|a| a.token.as_str());
    if expected_token.is_some() && token != expected_token {
        return Err(("UNAUTHORIZED".to_string(), "invalid token".to_string()));
    }
    if params.device.nonce.as_deref() != nonce {
        return Err(invalid("nonce mismatch"));
    }

    let payload = AuthPayload {
        device_id: &params.device.id,
        client_id: &params.client.id,
        client_mode: &params.client.mode,
        role: &params.role,
        scopes: &params.scopes,
        signed_at_ms: params.device.signed_at,
        token,
        nonce,
    }
    .canonical();

    let public: [u8; 32] = URL_SAFE_NO_PAD
        .decode(&params.device.public_key)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| invalid("bad public key"))?;
    let signature: [u8; 64] = URL_SAFE_NO_PAD
        .decode(&params.device.signature)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| invalid("bad signature encoding"))?;
    let key = VerifyingKey::from_bytes(&public).map_err(|_| invalid("bad public key"))?;
    key.verify(payload.as_bytes(), &Signature::from_bytes(&signature))
        .map_err(|_| ("UNAUTHORIZED".to_string(), "signature mismatch".to_string()))
}

fn scripted_messages(request: &RequestFrame, reply: MockReply) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(result) = reply.response {
        messages.push(text_message(&response(&request.id, result)));
    }
    for payload in reply.events {
        messages.push(event_message(EVENT_AGENT, payload));
    }
    messages
}

fn response(id: &str, result: Result<Value, (String, String)>) -> Frame {
    match result {
        Ok(payload) => Frame::Response(ResponseFrame {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }),
        Err((code, message)) => Frame::Response(ResponseFrame {
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: Some(code),
                message: Some(message),
            }),
        }),
    }
}

fn challenge_message() -> Message {
    event_message(
        EVENT_CONNECT_CHALLENGE,
        json!({
            "nonce": uuid::Uuid::new_v4().to_string(),
            "ts": chrono::Utc::now().timestamp_millis(),
        }),
    )
}

fn event_message(event: &str, payload: Value) -> Message {
    text_message(&Frame::Event(EventFrame {
        event: event.to_string(),
        payload: Some(payload),
        seq: None,
    }))
}

fn text_message(frame: &Frame) -> Message {
    // Frames built here always serialize
    Message::Text(frame.encode().unwrap_or_default())
}

fn send_live(state: &MockState, message: Message) -> bool {
    match lock(&state.live).as_ref() {
        Some(tx) => tx.send(message).is_ok(),
        None => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
