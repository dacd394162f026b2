// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session mapping and the human confirmation gate
//!
//! Each `(agent, user)` pair maps to a remote session id that the runtime
//! uses to keep conversation state. When a run pauses for confirmation the
//! paused run is parked here until the next request on the same session
//! either approves it or moves on.

use crate::config::{RunConfig, SessionMode};
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Final content returned when a run pauses for confirmation
pub const CONFIRMATION_NOTICE: &str = "This action requires your confirmation before the agent can continue. \
Reply with APPROVE to proceed, or send any other message to cancel it.";

const APPROVAL_TOKEN: &str = "approve";

/// Whether a user turn approves a pending confirmation
pub fn is_approval(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(APPROVAL_TOKEN)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(text.into())),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain text; only `text` parts contribute
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMapping {
    pub local_session_key: String,
    pub remote_session_id: String,
    pub last_accessed_at: Instant,
}

/// A run parked on a confirmation prompt
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApproval {
    pub session_key: String,
    pub remote_session_key: String,
    pub run_id: String,
    pub approval_id: Option<String>,
    pub created_at: Instant,
}

/// What to do with an incoming chat request
#[derive(Debug, Clone, PartialEq)]
pub enum TurnPlan {
    /// The user approved a parked run; resume it instead of starting a new one
    Resume(PendingApproval),
    /// Start a new run
    Run {
        local_session_key: String,
        remote_session_key: String,
        message: String,
        new_chat: bool,
    },
}

#[derive(Default)]
struct RegistryState {
    mappings: HashMap<String, SessionMapping>,
    approvals: HashMap<String, PendingApproval>,
}

pub struct SessionRegistry {
    mode: SessionMode,
    default_user: String,
    session_ttl: Duration,
    approval_ttl: Duration,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            mode: config.session_mode,
            default_user: config.default_user.clone(),
            session_ttl: config.session_ttl(),
            approval_ttl: config.approval_ttl(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn local_session_key(&self, agent_id: &str, user: Option<&str>) -> String {
        let user = user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.default_user);
        format!("{agent_id}:{user}")
    }

    pub fn plan_turn(
        &self,
        agent_id: &str,
        user: Option<&str>,
        messages: &[ChatMessage],
    ) -> RelayResult<TurnPlan> {
        self.plan_turn_at(Instant::now(), agent_id, user, messages)
    }

    pub fn plan_turn_at(
        &self,
        now: Instant,
        agent_id: &str,
        user: Option<&str>,
        messages: &[ChatMessage],
    ) -> RelayResult<TurnPlan> {
        let latest_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(ChatMessage::text)
            .ok_or_else(|| RelayError::InvalidRequest {
                message: "messages must contain at least one user message".to_string(),
            })?;
        let local_session_key = self.local_session_key(agent_id, user);
        let mut state = self.lock();

        if let Some(approval) = state.approvals.remove(&local_session_key) {
            if self.approval_expired(&approval, now) {
                debug!(session_key = %local_session_key, "Pending approval expired");
            } else if is_approval(&latest_user) {
                info!(session_key = %local_session_key, run_id = %approval.run_id, "User approved pending action");
                if let Some(mapping) = state.mappings.get_mut(&local_session_key) {
                    mapping.last_accessed_at = now;
                }
                return Ok(TurnPlan::Resume(approval));
            } else {
                info!(session_key = %local_session_key, run_id = %approval.run_id, "Pending approval discarded by new message");
            }
        }

        let existing = state
            .mappings
            .get_mut(&local_session_key)
            .filter(|mapping| now.saturating_duration_since(mapping.last_accessed_at) <= self.session_ttl);
        let (remote_session_key, new_chat) = match existing {
            Some(mapping) if messages.len() > 2 => {
                mapping.last_accessed_at = now;
                (mapping.remote_session_id.clone(), false)
            }
            _ => {
                let remote = uuid::Uuid::new_v4().to_string();
                debug!(session_key = %local_session_key, remote_session = %remote, "Starting new remote session");
                state.mappings.insert(
                    local_session_key.clone(),
                    SessionMapping {
                        local_session_key: local_session_key.clone(),
                        remote_session_id: remote.clone(),
                        last_accessed_at: now,
                    },
                );
                (remote, true)
            }
        };

        let message = match self.mode {
            SessionMode::Stateful => {
                let system = messages
                    .iter()
                    .find(|m| m.role == "system")
                    .map(ChatMessage::text)
                    .filter(|s| !s.is_empty());
                match system {
                    Some(system) if new_chat => format!("[System]\n{system}\n\n{latest_user}"),
                    _ => latest_user,
                }
            }
            SessionMode::Passthrough => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.text()))
                .collect::<Vec<_>>()
                .join("\n"),
        };

        Ok(TurnPlan::Run {
            local_session_key,
            remote_session_key,
            message,
            new_chat,
        })
    }

    /// Park a run awaiting confirmation, replacing any older one on the session
    pub fn record_approval(&self, approval: PendingApproval) {
        info!(session_key = %approval.session_key, run_id = %approval.run_id, "Run awaiting confirmation");
        self.lock()
            .approvals
            .insert(approval.session_key.clone(), approval);
    }

    pub fn remote_session_id(&self, local_session_key: &str) -> Option<String> {
        self.lock()
            .mappings
            .get(local_session_key)
            .map(|m| m.remote_session_id.clone())
    }

    pub fn pending_approval(&self, local_session_key: &str) -> Option<PendingApproval> {
        self.lock().approvals.get(local_session_key).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn approval_count(&self) -> usize {
        self.lock().approvals.len()
    }

    /// Drop idle mappings and stale approvals; returns how many of each went
    pub fn sweep(&self) -> (usize, usize) {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> (usize, usize) {
        let mut state = self.lock();
        let sessions_before = state.mappings.len();
        let approvals_before = state.approvals.len();

        let session_ttl = self.session_ttl;
        state
            .mappings
            .retain(|_, m| now.saturating_duration_since(m.last_accessed_at) <= session_ttl);
        state
            .approvals
            .retain(|_, a| !self.approval_expired(a, now));

        (
            sessions_before - state.mappings.len(),
            approvals_before - state.approvals.len(),
        )
    }

    /// Periodic sweep, independent of traffic, until `cancel` fires
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let (sessions, approvals) = registry.sweep();
                        if sessions > 0 || approvals > 0 {
                            info!(sessions, approvals, "Expired session state removed");
                        }
                    }
                }
            }
        })
    }

    fn approval_expired(&self, approval: &PendingApproval, now: Instant) -> bool {
        now.saturating_duration_since(approval.created_at) > self.approval_ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry(mode: SessionMode) -> SessionRegistry {
        SessionRegistry::new(&RunConfig {
            session_mode: mode,
            ..RunConfig::default()
        })
    }

    fn conversation(turns: &[(&str, &str)]) -> Vec<ChatMessage> {
        turns.iter().map(|(role, text)| ChatMessage::new(*role, *text)).collect()
    }

    fn run_plan(plan: TurnPlan) -> (String, String, String, bool) {
        match plan {
            TurnPlan::Run {
                local_session_key,
                remote_session_key,
                message,
                new_chat,
            } => (local_session_key, remote_session_key, message, new_chat),
            other => panic!("expected a new run, got {other:?}"),
        }
    }

    fn approval(session_key: &str, created_at: Instant) -> PendingApproval {
        PendingApproval {
            session_key: session_key.to_string(),
            remote_session_key: "remote-1".to_string(),
            run_id: "r1".to_string(),
            approval_id: Some("appr-1".to_string()),
            created_at,
        }
    }

    #[test]
    fn single_user_message_starts_fresh_session() {
        let registry = registry(SessionMode::Stateful);
        let plan = registry
            .plan_turn("main", None, &conversation(&[("user", "hi")]))
            .unwrap();
        let (local, remote, message, new_chat) = run_plan(plan);

        assert_eq!(local, "main:default");
        assert_eq!(message, "hi");
        assert!(new_chat);
        assert!(uuid::Uuid::parse_str(&remote).is_ok());
        assert_eq!(registry.remote_session_id("main:default"), Some(remote));
    }

    #[test]
    fn system_prompt_only_prefixes_new_chats() {
        let registry = registry(SessionMode::Stateful);
        let first = conversation(&[("system", "Be brief."), ("user", "hi")]);
        let (_, remote, message, _) = run_plan(registry.plan_turn("main", Some("ann"), &first).unwrap());
        assert_eq!(message, "[System]\nBe brief.\n\nhi");

        let follow_up = conversation(&[
            ("system", "Be brief."),
            ("user", "hi"),
            ("assistant", "hello"),
            ("user", "more"),
        ]);
        let (local, reused, message, new_chat) =
            run_plan(registry.plan_turn("main", Some("ann"), &follow_up).unwrap());
        assert_eq!(local, "main:ann");
        assert_eq!(reused, remote);
        assert_eq!(message, "more");
        assert!(!new_chat);
    }

    #[test]
    fn short_history_resets_the_mapping() {
        let registry = registry(SessionMode::Stateful);
        let (_, first, _, _) = run_plan(
            registry
                .plan_turn("main", None, &conversation(&[("user", "a")]))
                .unwrap(),
        );
        let (_, second, _, new_chat) = run_plan(
            registry
                .plan_turn("main", None, &conversation(&[("user", "b")]))
                .unwrap(),
        );
        assert!(new_chat);
        assert_ne!(first, second);
    }

    #[test]
    fn long_history_without_mapping_is_a_new_chat() {
        let registry = registry(SessionMode::Stateful);
        let messages = conversation(&[("user", "a"), ("assistant", "b"), ("user", "c")]);
        let (_, _, message, new_chat) = run_plan(registry.plan_turn("main", None, &messages).unwrap());
        assert!(new_chat);
        assert_eq!(message, "c");
    }

    #[test]
    fn passthrough_sends_the_transcript() {
        let registry = registry(SessionMode::Passthrough);
        let messages = conversation(&[("system", "S"), ("user", "a"), ("assistant", "b"), ("user", "c")]);
        let (_, _, message, _) = run_plan(registry.plan_turn("main", None, &messages).unwrap());
        assert_eq!(message, "system: S\nuser: a\nassistant: b\nuser: c");
    }

    #[test]
    fn content_parts_are_concatenated() {
        let message: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "image_url"},
                {"type": "text", "text": "there"}
            ]
        }))
        .unwrap();
        assert_eq!(message.text(), "Hello there");
    }

    #[test]
    fn requests_without_user_messages_are_rejected() {
        let registry = registry(SessionMode::Stateful);
        let err = registry
            .plan_turn("main", None, &conversation(&[("system", "x")]))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest { .. }));
    }

    #[test]
    fn approval_token_matching() {
        assert!(is_approval("approve"));
        assert!(is_approval("  ApProVe "));
        assert!(!is_approval("approved"));
        assert!(!is_approval("yes"));
    }

    #[test]
    fn approve_resumes_the_parked_run() {
        let registry = registry(SessionMode::Stateful);
        let now = Instant::now();
        registry.record_approval(approval("main:default", now));

        let plan = registry
            .plan_turn_at(now, "main", None, &conversation(&[("user", "  ApProVe ")]))
            .unwrap();
        assert_eq!(plan, TurnPlan::Resume(approval("main:default", now)));
        assert_eq!(registry.approval_count(), 0);
    }

    #[test]
    fn approval_turn_keeps_the_session_alive() {
        let registry = registry(SessionMode::Stateful);
        let start = Instant::now();
        let (local, remote, _, _) = run_plan(
            registry
                .plan_turn_at(start, "main", None, &conversation(&[("user", "clean up")]))
                .unwrap(),
        );

        let approved_at = start + 23 * HOUR;
        registry.record_approval(approval(&local, approved_at));
        let plan = registry
            .plan_turn_at(approved_at, "main", None, &conversation(&[("user", "approve")]))
            .unwrap();
        assert!(matches!(plan, TurnPlan::Resume(_)));

        assert_eq!(registry.sweep_at(start + 30 * HOUR), (0, 0));
        assert_eq!(registry.remote_session_id(&local), Some(remote));
    }

    #[test]
    fn other_messages_discard_the_approval() {
        let registry = registry(SessionMode::Stateful);
        let now = Instant::now();
        registry.record_approval(approval("main:default", now));

        let plan = registry
            .plan_turn_at(now, "main", None, &conversation(&[("user", "no, stop")]))
            .unwrap();
        let (_, _, message, _) = run_plan(plan);
        assert_eq!(message, "no, stop");
        assert_eq!(registry.pending_approval("main:default"), None);

        // A later "approve" has nothing to resume
        let plan = registry
            .plan_turn_at(now, "main", None, &conversation(&[("user", "approve")]))
            .unwrap();
        assert!(matches!(plan, TurnPlan::Run { .. }));
    }

    #[test]
    fn approvals_are_scoped_per_session() {
        let registry = registry(SessionMode::Stateful);
        let now = Instant::now();
        registry.record_approval(approval("main:alice", now));

        let plan = registry
            .plan_turn_at(now, "main", Some("bob"), &conversation(&[("user", "approve")]))
            .unwrap();
        assert!(matches!(plan, TurnPlan::Run { .. }));
        assert!(registry.pending_approval("main:alice").is_some());
    }

    #[test]
    fn expired_approval_is_ignored_on_read() {
        let registry = registry(SessionMode::Stateful);
        let start = Instant::now();
        registry.record_approval(approval("main:default", start));

        let plan = registry
            .plan_turn_at(
                start + HOUR + Duration::from_secs(1),
                "main",
                None,
                &conversation(&[("user", "approve")]),
            )
            .unwrap();
        assert!(matches!(plan, TurnPlan::Run { .. }));
    }

    #[test]
    fn sweep_honours_ttls() {
        let registry = registry(SessionMode::Stateful);
        let start = Instant::now();
        registry
            .plan_turn_at(start, "main", Some("a"), &conversation(&[("user", "x")]))
            .unwrap();
        registry.record_approval(approval("main:a", start));

        assert_eq!(registry.sweep_at(start + HOUR - Duration::from_secs(1)), (0, 0));
        assert_eq!(registry.sweep_at(start + HOUR + Duration::from_secs(1)), (0, 1));
        assert_eq!(registry.session_count(), 1);

        // Access refreshes the idle clock
        let later = start + 23 * HOUR;
        let messages = conversation(&[("user", "x"), ("assistant", "y"), ("user", "z")]);
        let (_, _, _, new_chat) = run_plan(registry.plan_turn_at(later, "main", Some("a"), &messages).unwrap());
        assert!(!new_chat);
        assert_eq!(registry.sweep_at(start + 30 * HOUR), (0, 0));
        assert_eq!(registry.sweep_at(later + 24 * HOUR + Duration::from_secs(1)), (1, 0));
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn idle_mapping_is_ignored_on_read() {
        let registry = registry(SessionMode::Stateful);
        let start = Instant::now();
        let (_, first, _, _) = run_plan(
            registry
                .plan_turn_at(start, "main", None, &conversation(&[("user", "x")]))
                .unwrap(),
        );
        let messages = conversation(&[("user", "x"), ("assistant", "y"), ("user", "z")]);
        let (_, second, _, new_chat) = run_plan(
            registry
                .plan_turn_at(start + 25 * HOUR, "main", None, &messages)
                .unwrap(),
        );
        assert!(new_chat);
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_without_traffic() {
        let registry = Arc::new(SessionRegistry::new(&RunConfig {
            approval_ttl_secs: 1,
            ..RunConfig::default()
        }));
        registry.record_approval(approval("main:default", Instant::now()));

        let cancel = CancellationToken::new();
        let task = registry.spawn_maintenance(Duration::from_millis(100), cancel.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.approval_count(), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(registry.approval_count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
