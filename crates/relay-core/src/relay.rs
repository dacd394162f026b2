// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chat completion orchestration over agent runs
//!
//! Turns one OpenAI-style chat request into either a new agent run or the
//! resumption of a run parked on a confirmation prompt, then shapes the run's
//! events into a buffered completion or a stream of completion chunks.

use crate::config::RunConfig;
use crate::connection::GatewayRpc;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{AgentEvent, RunSignal};
use crate::reassembler::{finalize, StreamReassembler, THINK_SEPARATOR};
use crate::runs::{RunCorrelator, RunHandle, RunRequest};
use crate::sessions::{
    ChatMessage, PendingApproval, SessionRegistry, TurnPlan, CONFIRMATION_NOTICE,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Incoming chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Buffered chat completion response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

impl ChatCompletion {
    pub fn content(&self) -> String {
        self.choices
            .first()
            .map(|choice| choice.message.text())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// Token accounting is not tracked; always zero
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One item of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// `chat.completion.chunk` object
    Chunk(Value),
    /// The run failed after streaming started
    Error(String),
    /// End of stream
    Done,
}

pub type ChatStream = BoxStream<'static, StreamItem>;

/// A run the relay is currently reading from
struct ActiveRun {
    handle: RunHandle,
    local_session_key: String,
    remote_session_key: String,
}

/// How an agent event ends the run, if it does
enum Outcome {
    Completed,
    Failed(String),
    ConfirmationRequired,
}

#[derive(Clone)]
pub struct ChatRelay {
    runs: RunCorrelator,
    sessions: Arc<SessionRegistry>,
    config: RunConfig,
}

impl ChatRelay {
    pub fn new(
        gateway: Arc<dyn GatewayRpc>,
        sessions: Arc<SessionRegistry>,
        config: RunConfig,
    ) -> Self {
        Self {
            runs: RunCorrelator::new(gateway, config.abort_on_disconnect),
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn is_connected(&self) -> bool {
        self.runs.gateway().is_connected()
    }

    /// Map a model name onto an agent id.
    ///
    /// `openclaw:<id>` and `openclaw/<id>` select `<id>`; the bare prefix or
    /// an empty model selects the default agent; anything else is taken as
    /// the agent id itself.
    pub fn resolve_agent_id(&self, model: &str) -> String {
        let model = model.trim();
        let prefix = self.config.model_prefix.as_str();
        if model.is_empty() || model == prefix {
            return self.config.default_agent_id.clone();
        }
        let selected = model
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':').or_else(|| rest.strip_prefix('/')));
        match selected {
            Some("") => self.config.default_agent_id.clone(),
            Some(agent_id) => agent_id.to_string(),
            None => model.to_string(),
        }
    }

    /// Run to completion and return the whole answer. Bounded by the run timeout.
    pub async fn complete(&self, request: ChatRequest) -> RelayResult<ChatCompletion> {
        let timeout = self.config.run_timeout();
        let content = match tokio::time::timeout(timeout, self.collect(&request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(model = %request.model, timeout_ms = self.config.run_timeout_ms, "Run timed out");
                return Err(RelayError::RunTimeout {
                    timeout_ms: self.config.run_timeout_ms,
                });
            }
        };

        Ok(ChatCompletion {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage::new("assistant", content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        })
    }

    /// Start the run and stream its output. Failures before the run starts
    /// are returned directly; later failures arrive as [`StreamItem::Error`].
    pub async fn stream(&self, request: ChatRequest) -> RelayResult<ChatStream> {
        let run = self.begin(&request).await?;
        let chunks = ChunkFactory {
            id: completion_id(),
            model: request.model,
            created: chrono::Utc::now().timestamp(),
        };
        let mut queued = VecDeque::new();
        queued.push_back(StreamItem::Chunk(
            chunks.chunk(json!({"role": "assistant"}), None),
        ));

        let state = StreamState {
            run,
            sessions: Arc::clone(&self.sessions),
            reassembler: StreamReassembler::new(),
            chunks,
            queued,
            emitted_content: false,
            ends_with_separator: false,
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.queued.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                state.advance().await;
            }
        })
        .boxed())
    }

    async fn collect(&self, request: &ChatRequest) -> RelayResult<String> {
        let mut run = self.begin(request).await?;
        let mut reassembler = StreamReassembler::new();
        loop {
            let Some(event) = run.handle.next_event().await else {
                return Err(RelayError::ConnectionClosed);
            };
            if let Some(delta) = &event.delta {
                reassembler.push(delta);
            }
            match outcome(&event) {
                None => {}
                Some(Outcome::Completed) => {
                    debug!(run_id = ?run.handle.run_id(), "Run completed");
                    return Ok(finalize(
                        reassembler.accumulated_content(),
                        reassembler.accumulated_reasoning(),
                    ));
                }
                Some(Outcome::Failed(message)) => {
                    return Err(RelayError::Remote {
                        code: None,
                        message,
                    });
                }
                Some(Outcome::ConfirmationRequired) => {
                    park(&self.sessions, &run, &event);
                    let answer = finalize(
                        reassembler.accumulated_content(),
                        reassembler.accumulated_reasoning(),
                    );
                    return Ok(with_notice(&answer));
                }
            }
        }
    }

    async fn begin(&self, request: &ChatRequest) -> RelayResult<ActiveRun> {
        let agent_id = self.resolve_agent_id(&request.model);
        let plan = self
            .sessions
            .plan_turn(&agent_id, request.user.as_deref(), &request.messages)?;

        match plan {
            TurnPlan::Resume(approval) => {
                let handle = self
                    .runs
                    .resume(
                        &approval.remote_session_key,
                        &approval.run_id,
                        approval.approval_id.as_deref(),
                    )
                    .await?;
                Ok(ActiveRun {
                    handle,
                    local_session_key: approval.session_key,
                    remote_session_key: approval.remote_session_key,
                })
            }
            TurnPlan::Run {
                local_session_key,
                remote_session_key,
                message,
                new_chat,
            } => {
                info!(agent_id = %agent_id, session_key = %local_session_key, new_chat, "Starting agent run");
                let handle = self
                    .runs
                    .start(RunRequest {
                        agent_id,
                        session_key: remote_session_key.clone(),
                        message,
                        idempotency_key: uuid::Uuid::new_v4().to_string(),
                    })
                    .await?;
                Ok(ActiveRun {
                    handle,
                    local_session_key,
                    remote_session_key,
                })
            }
        }
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

fn with_notice(answer: &str) -> String {
    if answer.is_empty() || answer.ends_with(THINK_SEPARATOR) {
        format!("{answer}{CONFIRMATION_NOTICE}")
    } else {
        format!("{answer}\n\n{CONFIRMATION_NOTICE}")
    }
}

fn outcome(event: &AgentEvent) -> Option<Outcome> {
    match event.signal.as_ref()? {
        RunSignal::Completed => Some(Outcome::Completed),
        RunSignal::Failed { message } => Some(Outcome::Failed(message.clone())),
        RunSignal::ConfirmationRequired { .. } => Some(Outcome::ConfirmationRequired),
        RunSignal::Started => None,
    }
}

/// Record a run paused on confirmation so the next turn can approve it
fn park(sessions: &SessionRegistry, run: &ActiveRun, event: &AgentEvent) {
    let approval_id = match &event.signal {
        Some(RunSignal::ConfirmationRequired { approval_id, .. }) => approval_id.clone(),
        _ => None,
    };
    let Some(run_id) = run
        .handle
        .run_id()
        .or(event.run_id.as_deref())
        .map(str::to_string)
    else {
        warn!(session_key = %run.local_session_key, "Confirmation requested for a run without id");
        return;
    };
    sessions.record_approval(PendingApproval {
        session_key: run.local_session_key.clone(),
        remote_session_key: run.remote_session_key.clone(),
        run_id,
        approval_id,
        created_at: Instant::now(),
    });
}

struct ChunkFactory {
    id: String,
    model: String,
    created: i64,
}

impl ChunkFactory {
    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn content(&self, text: &str) -> StreamItem {
        StreamItem::Chunk(self.chunk(json!({ "content": text }), None))
    }

    fn stop(&self) -> StreamItem {
        StreamItem::Chunk(self.chunk(json!({}), Some("stop")))
    }
}

struct StreamState {
    run: ActiveRun,
    sessions: Arc<SessionRegistry>,
    reassembler: StreamReassembler,
    chunks: ChunkFactory,
    queued: VecDeque<StreamItem>,
    emitted_content: bool,
    /// Last emitted content already ends a paragraph
    ends_with_separator: bool,
    done: bool,
}

impl StreamState {
    async fn advance(&mut self) {
        let Some(event) = self.run.handle.next_event().await else {
            self.queued
                .push_back(StreamItem::Error("gateway connection closed".to_string()));
            self.end();
            return;
        };

        if let Some(delta) = event.delta.as_ref().and_then(|d| self.reassembler.push(d)) {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                self.emitted_content = true;
                self.ends_with_separator = content.ends_with(THINK_SEPARATOR);
            }
            self.queued
                .push_back(StreamItem::Chunk(self.chunks.chunk(Value::Object(delta), None)));
        }

        match outcome(&event) {
            None => {}
            Some(Outcome::Completed) => {
                self.close_reasoning();
                self.queued.push_back(self.chunks.stop());
                self.end();
            }
            Some(Outcome::Failed(message)) => {
                warn!(run_id = ?self.run.handle.run_id(), error = %message, "Run failed mid-stream");
                self.queued.push_back(StreamItem::Error(message));
                self.end();
            }
            Some(Outcome::ConfirmationRequired) => {
                park(&self.sessions, &self.run, &event);
                self.close_reasoning();
                let notice = if self.emitted_content && !self.ends_with_separator {
                    format!("{THINK_SEPARATOR}{CONFIRMATION_NOTICE}")
                } else {
                    CONFIRMATION_NOTICE.to_string()
                };
                self.queued.push_back(self.chunks.content(&notice));
                self.queued.push_back(self.chunks.stop());
                self.end();
            }
        }
    }

    fn close_reasoning(&mut self) {
        if let Some(text) = self.reassembler.finish() {
            self.emitted_content = true;
            self.ends_with_separator = text.ends_with(THINK_SEPARATOR);
            self.queued.push_back(self.chunks.content(&text));
        }
    }

    fn end(&mut self) {
        self.run.handle.finish();
        self.queued.push_back(StreamItem::Done);
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeltaPayload;
    use crate::testing::{delta_event, signal_event, FakeGateway};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn relay(gateway: Arc<FakeGateway>, config: RunConfig) -> ChatRelay {
        let sessions = Arc::new(SessionRegistry::new(&config));
        ChatRelay::new(gateway, sessions, config)
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "openclaw:main".to_string(),
            messages: vec![ChatMessage::new("user", text)],
            stream: false,
            user: None,
        }
    }

    /// Gateway whose `agent` calls return `run_id` and immediately play `events`
    fn scripted(run_id: &'static str, events: Vec<AgentEvent>) -> Arc<FakeGateway> {
        FakeGateway::with_responder(move |method, _, bus| {
            if method == "agent" || method == "exec.approval.resolve" {
                for event in &events {
                    bus.publish(crate::events::GatewayEvent::Agent(event.clone()));
                }
            }
            Ok(json!({ "runId": run_id }))
        })
    }

    async fn collect_stream(stream: ChatStream) -> Vec<StreamItem> {
        stream.collect().await
    }

    fn chunk_contents(items: &[StreamItem]) -> String {
        items
            .iter()
            .filter_map(|item| match item {
                StreamItem::Chunk(chunk) => chunk["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn model_names_map_to_agents() {
        let relay = relay(FakeGateway::with_run_id("r"), RunConfig::default());
        assert_eq!(relay.resolve_agent_id("openclaw:research"), "research");
        assert_eq!(relay.resolve_agent_id("openclaw/coder"), "coder");
        assert_eq!(relay.resolve_agent_id("openclaw"), "main");
        assert_eq!(relay.resolve_agent_id(""), "main");
        assert_eq!(relay.resolve_agent_id("openclaw:"), "main");
        assert_eq!(relay.resolve_agent_id("gpt-4o"), "gpt-4o");
    }

    #[tokio::test]
    async fn buffered_completion_with_reasoning() {
        let gateway = scripted(
            "r1",
            vec![
                delta_event("r1", DeltaPayload::reasoning("plan")),
                delta_event("r1", DeltaPayload::content("G")),
                delta_event("r1", DeltaPayload::content("GE")),
                delta_event("r1", DeltaPayload::content("GEM")),
                signal_event("r1", RunSignal::Completed),
            ],
        );
        let relay = relay(gateway.clone(), RunConfig::default());
        let completion = relay.complete(request("hi")).await.unwrap();

        assert_eq!(completion.object, "chat.completion");
        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.model, "openclaw:main");
        assert_eq!(completion.content(), "<think>plan</think>\n\nGEM");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage, Usage::default());

        let agent_calls = gateway.calls_to("agent");
        assert_eq!(agent_calls.len(), 1);
        assert_eq!(agent_calls[0]["message"], "hi");
        assert_eq!(agent_calls[0]["agentId"], "main");
        assert_eq!(gateway.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn buffered_failure_is_reported() {
        let gateway = scripted(
            "r1",
            vec![signal_event(
                "r1",
                RunSignal::Failed {
                    message: "tool crashed".to_string(),
                },
            )],
        );
        let relay = relay(gateway, RunConfig::default());
        match relay.complete(request("hi")).await {
            Err(RelayError::Remote { message, .. }) => assert_eq!(message, "tool crashed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_run_times_out_and_deregisters() {
        let gateway = scripted("r1", vec![]);
        let relay = relay(
            gateway.clone(),
            RunConfig {
                run_timeout_ms: 60_000,
                ..RunConfig::default()
            },
        );
        let err = relay.complete(request("hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::RunTimeout { timeout_ms: 60_000 }));
        assert_eq!(gateway.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn streaming_emits_role_deltas_and_stop() {
        let gateway = scripted(
            "r1",
            vec![
                delta_event("r1", DeltaPayload::content("Hel")),
                delta_event("r1", DeltaPayload::content("Hello")),
                signal_event("r1", RunSignal::Completed),
            ],
        );
        let relay = relay(gateway.clone(), RunConfig::default());
        let items = collect_stream(relay.stream(request("hi")).await.unwrap()).await;

        let StreamItem::Chunk(first) = &items[0] else {
            panic!("expected first chunk");
        };
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

        assert_eq!(chunk_contents(&items), "Hello");
        let StreamItem::Chunk(last) = &items[items.len() - 2] else {
            panic!("expected stop chunk");
        };
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(items.last(), Some(&StreamItem::Done));
        assert_eq!(gateway.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn streaming_failure_yields_error_then_done() {
        let gateway = scripted(
            "r1",
            vec![
                delta_event("r1", DeltaPayload::content("partial")),
                signal_event(
                    "r1",
                    RunSignal::Failed {
                        message: "boom".to_string(),
                    },
                ),
            ],
        );
        let relay = relay(gateway, RunConfig::default());
        let items = collect_stream(relay.stream(request("hi")).await.unwrap()).await;
        let tail: Vec<_> = items.iter().rev().take(2).cloned().collect();
        assert_eq!(
            tail,
            vec![StreamItem::Done, StreamItem::Error("boom".to_string())]
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_deregisters() {
        let gateway = scripted("r1", vec![delta_event("r1", DeltaPayload::content("x"))]);
        let relay = relay(gateway.clone(), RunConfig::default());
        let mut stream = relay.stream(request("hi")).await.unwrap();
        assert!(stream.next().await.is_some());
        assert_eq!(gateway.bus.listener_count(), 1);
        drop(stream);
        assert_eq!(gateway.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn confirmation_then_approve_resumes_same_run() {
        let gateway = FakeGateway::with_responder(|method, _, bus| {
            let events = match method {
                "agent" => vec![signal_event(
                    "r1",
                    RunSignal::ConfirmationRequired {
                        approval_id: Some("appr-9".to_string()),
                        prompt: Some("rm -rf build?".to_string()),
                    },
                )],
                "exec.approval.resolve" => vec![
                    delta_event("r1", DeltaPayload::content("Deleted.")),
                    signal_event("r1", RunSignal::Completed),
                ],
                _ => vec![],
            };
            for event in events {
                bus.publish(crate::events::GatewayEvent::Agent(event));
            }
            Ok(json!({"runId": "r1"}))
        });
        let relay = relay(gateway.clone(), RunConfig::default());

        let first = relay.complete(request("clean the build dir")).await.unwrap();
        assert_eq!(first.content(), CONFIRMATION_NOTICE);
        assert!(first.content().contains("APPROVE"));
        assert_eq!(first.choices[0].finish_reason, "stop");
        assert_eq!(relay.sessions().approval_count(), 1);

        let second = relay.complete(request("  ApProVe ")).await.unwrap();
        assert_eq!(second.content(), "Deleted.");
        assert_eq!(gateway.calls_to("agent").len(), 1);
        let resolves = gateway.calls_to("exec.approval.resolve");
        assert_eq!(resolves.len(), 1);
        assert_eq!(resolves[0]["runId"], "r1");
        assert_eq!(resolves[0]["requestId"], "appr-9");
        assert_eq!(resolves[0]["sessionKey"], gateway.calls_to("agent")[0]["sessionKey"]);
        assert_eq!(relay.sessions().approval_count(), 0);
    }

    #[tokio::test]
    async fn confirmation_then_other_message_starts_new_run() {
        let gateway = FakeGateway::with_responder(|method, params, bus| {
            if method == "agent" {
                let event = if params["message"] == "first" {
                    signal_event(
                        "r1",
                        RunSignal::ConfirmationRequired {
                            approval_id: None,
                            prompt: None,
                        },
                    )
                } else {
                    signal_event("r2", RunSignal::Completed)
                };
                let run_id = event.run_id.clone();
                bus.publish(crate::events::GatewayEvent::Agent(event));
                return Ok(json!({ "runId": run_id }));
            }
            Ok(json!({}))
        });
        let relay = relay(gateway.clone(), RunConfig::default());

        relay.complete(request("first")).await.unwrap();
        relay.complete(request("never mind")).await.unwrap();

        assert_eq!(gateway.calls_to("agent").len(), 2);
        assert!(gateway.calls_to("exec.approval.resolve").is_empty());
        assert_eq!(relay.sessions().approval_count(), 0);
    }

    #[tokio::test]
    async fn streaming_confirmation_emits_notice() {
        let gateway = scripted(
            "r1",
            vec![
                delta_event("r1", DeltaPayload::reasoning("risky")),
                signal_event(
                    "r1",
                    RunSignal::ConfirmationRequired {
                        approval_id: None,
                        prompt: None,
                    },
                ),
            ],
        );
        let relay = relay(gateway, RunConfig::default());
        let items = collect_stream(relay.stream(request("do it")).await.unwrap()).await;
        let text = chunk_contents(&items);
        assert_eq!(text, format!("<think>risky</think>\n\n{CONFIRMATION_NOTICE}"));
        assert_eq!(items.last(), Some(&StreamItem::Done));
        assert_eq!(relay.sessions().approval_count(), 1);
    }

    #[tokio::test]
    async fn confirmation_notice_is_separated_once() {
        let reasoning_only = vec![
            delta_event("r1", DeltaPayload::reasoning("risky")),
            signal_event(
                "r1",
                RunSignal::ConfirmationRequired {
                    approval_id: None,
                    prompt: None,
                },
            ),
        ];
        let relay_a = relay(scripted("r1", reasoning_only), RunConfig::default());
        let completion = relay_a.complete(request("do it")).await.unwrap();
        assert_eq!(
            completion.content(),
            format!("<think>risky</think>\n\n{CONFIRMATION_NOTICE}")
        );

        let with_content = vec![
            delta_event("r1", DeltaPayload::content("Deleting build/")),
            signal_event(
                "r1",
                RunSignal::ConfirmationRequired {
                    approval_id: None,
                    prompt: None,
                },
            ),
        ];
        let relay_b = relay(scripted("r1", with_content), RunConfig::default());
        let items = collect_stream(relay_b.stream(request("do it")).await.unwrap()).await;
        assert_eq!(
            chunk_contents(&items),
            format!("Deleting build/\n\n{CONFIRMATION_NOTICE}")
        );
    }

    #[tokio::test]
    async fn disconnected_gateway_fails_before_streaming() {
        let gateway = FakeGateway::with_run_id("r1");
        gateway.set_connected(false);
        let relay = relay(gateway, RunConfig::default());
        assert!(matches!(
            relay.stream(request("hi")).await,
            Err(RelayError::NotConnected)
        ));
        assert!(matches!(
            relay.complete(request("hi")).await,
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connection_loss_ends_the_stream() {
        let gateway = scripted("r1", vec![delta_event("r1", DeltaPayload::content("a"))]);
        let relay = relay(gateway.clone(), RunConfig::default());
        let mut stream = relay.stream(request("hi")).await.unwrap();
        gateway.bus.publish(crate::events::GatewayEvent::ConnectionLost);

        let items = tokio::time::timeout(Duration::from_secs(1), async {
            let mut items = Vec::new();
            while let Some(item) = stream.next().await {
                items.push(item);
            }
            items
        })
        .await
        .unwrap();
        assert_eq!(
            items[items.len() - 2..].to_vec(),
            vec![
                StreamItem::Error("gateway connection closed".to_string()),
                StreamItem::Done
            ]
        );
    }
}
