// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire format of the agent runtime channel
//!
//! Every WebSocket text message is one JSON frame tagged by `type`:
//! `req` (client call), `res` (reply to a call), `event` (server push).
//! Agent events get one explicit normalization step ([`AgentEvent::from_payload`])
//! so the rest of the crate never pokes at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_AGENT: &str = "agent";

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_AGENT: &str = "agent";
pub const METHOD_APPROVAL_RESOLVE: &str = "exec.approval.resolve";
pub const METHOD_CHAT_ABORT: &str = "chat.abort";

/// Keys under which runtimes deliver reasoning text, in priority order
pub const REASONING_ALIASES: [&str; 4] = ["reasoning_content", "reasoning", "thinking", "thought"];

/// Frame parsing failures. Logged and dropped by the connection reader.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected payload for '{event}': {reason}")]
    UnexpectedPayload { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    /// New request with a fresh UUID v4 id
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Payload of `connect.challenge`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl ChallengePayload {
    pub fn from_event(frame: &EventFrame) -> Result<Self, ProtocolError> {
        let payload = frame.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(|e| ProtocolError::UnexpectedPayload {
            event: frame.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Params of the `connect` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    pub device: DeviceParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Terminal or state-changing signal carried by an agent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSignal {
    Started,
    Completed,
    Failed { message: String },
    ConfirmationRequired {
        approval_id: Option<String>,
        prompt: Option<String>,
    },
}

impl RunSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunSignal::Started)
    }
}

/// One streamed fragment of assistant output, normalized from either a bare
/// string or an object delta.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaPayload {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    /// Remaining keys forwarded downstream as-is (e.g. `role`)
    pub extra: Map<String, Value>,
}

impl DeltaPayload {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    /// Returns `None` for shapes that carry no delta (null, numbers, arrays).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::content(text.clone())),
            Value::Object(map) => {
                let mut extra = map.clone();
                let content = match extra.remove("content") {
                    Some(Value::String(text)) => Some(text),
                    _ => None,
                };

                let mut reasoning = None;
                for alias in REASONING_ALIASES {
                    if let Some(Value::String(text)) = extra.remove(alias) {
                        if reasoning.is_none() && !text.is_empty() {
                            reasoning = Some(text);
                        }
                    }
                }

                Some(Self {
                    content,
                    reasoning,
                    extra,
                })
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.reasoning.as_deref().is_none_or(str::is_empty)
            && self.extra.is_empty()
    }
}

/// Normalized payload of an `agent` event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentEvent {
    pub run_id: Option<String>,
    pub session_key: Option<String>,
    pub seq: Option<u64>,
    pub delta: Option<DeltaPayload>,
    pub signal: Option<RunSignal>,
}

impl AgentEvent {
    pub fn from_payload(payload: &Value) -> Result<Self, ProtocolError> {
        let Value::Object(obj) = payload else {
            return Err(ProtocolError::UnexpectedPayload {
                event: EVENT_AGENT.to_string(),
                reason: "payload is not an object".to_string(),
            });
        };
        let data = obj.get("data").and_then(Value::as_object);
        let stream = str_field(obj, "stream");

        let delta = obj
            .get("delta")
            .or_else(|| data.and_then(|d| d.get("delta")))
            .and_then(DeltaPayload::from_value)
            .or_else(|| {
                // Assistant stream snapshots carry the full text so far
                if stream != Some("assistant") {
                    return None;
                }
                data.and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .map(DeltaPayload::content)
            });

        let signal = match str_field(obj, "status") {
            Some(status) => status_signal(status, obj, data),
            None => None,
        }
        .or_else(|| {
            if stream != Some("lifecycle") {
                return None;
            }
            let phase = data
                .and_then(|d| d.get("phase"))
                .and_then(Value::as_str)
                .or_else(|| str_field(obj, "phase"))?;
            match phase {
                "start" => Some(RunSignal::Started),
                "end" => Some(RunSignal::Completed),
                "error" => Some(RunSignal::Failed {
                    message: error_message(obj, data),
                }),
                _ => None,
            }
        });

        Ok(Self {
            run_id: str_field(obj, "runId").map(str::to_string),
            session_key: str_field(obj, "sessionKey").map(str::to_string),
            seq: obj.get("seq").and_then(Value::as_u64),
            delta,
            signal,
        })
    }
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn status_signal(
    status: &str,
    obj: &Map<String, Value>,
    data: Option<&Map<String, Value>>,
) -> Option<RunSignal> {
    match status.to_ascii_lowercase().as_str() {
        "done" | "completed" | "finished" => Some(RunSignal::Completed),
        "error" | "failed" => Some(RunSignal::Failed {
            message: error_message(obj, data),
        }),
        "confirmation_required"
        | "awaiting_confirmation"
        | "requires_confirmation"
        | "approval_required" => {
            let approval_id = str_field(obj, "approvalId")
                .or_else(|| data.and_then(|d| str_field(d, "approvalId")))
                .or_else(|| str_field(obj, "requestId"))
                .map(str::to_string);
            let prompt = str_field(obj, "prompt")
                .or_else(|| data.and_then(|d| str_field(d, "prompt")))
                .map(str::to_string);
            Some(RunSignal::ConfirmationRequired {
                approval_id,
                prompt,
            })
        }
        "started" | "running" | "accepted" => Some(RunSignal::Started),
        _ => None,
    }
}

fn error_message(obj: &Map<String, Value>, data: Option<&Map<String, Value>>) -> String {
    let extract = |value: &Value| match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(err) => str_field(err, "message").map(str::to_string),
        _ => None,
    };
    obj.get("error")
        .and_then(extract)
        .or_else(|| data.and_then(|d| d.get("error")).and_then(extract))
        .unwrap_or_else(|| "agent run failed".to_string())
}
