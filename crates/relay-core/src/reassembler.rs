// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reassembly of streamed agent deltas into one incremental output
//!
//! Runtimes mix incremental chunks and cumulative snapshots, and deliver
//! reasoning under several keys. Reasoning is folded into the content stream
//! inside a single `<think>...</think>` block ahead of the answer.

use crate::protocol::DeltaPayload;
use serde_json::{Map, Value};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const THINK_SEPARATOR: &str = "\n\n";

/// Fold `value` into `accumulated` and return the new text it contributes.
///
/// A value that extends the accumulation is treated as a cumulative snapshot.
/// Known limitation: an incremental chunk that happens to start with the
/// accumulated text is misread as a snapshot and truncated. The wire format
/// carries no signal to tell the two apart.
pub fn incremental(accumulated: &mut String, value: &str) -> String {
    if !accumulated.is_empty() && value.starts_with(accumulated.as_str()) {
        let contribution = value[accumulated.len()..].to_string();
        *accumulated = value.to_string();
        contribution
    } else {
        accumulated.push_str(value);
        value.to_string()
    }
}

/// Per-run reassembly state
#[derive(Debug, Default, Clone)]
pub struct StreamReassembler {
    is_thinking: bool,
    has_bailed: bool,
    has_closed: bool,
    accumulated_reasoning: String,
    accumulated_content: String,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn one delta into the object forwarded downstream, or `None` when
    /// there is nothing to forward.
    pub fn push(&mut self, delta: &DeltaPayload) -> Option<Map<String, Value>> {
        let reasoning = delta
            .reasoning
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| incremental(&mut self.accumulated_reasoning, r))
            .unwrap_or_default();
        let raw_content = delta.content.as_deref().unwrap_or_default();
        let content = if raw_content.is_empty() {
            String::new()
        } else {
            incremental(&mut self.accumulated_content, raw_content)
        };

        let mut text = String::new();
        if !self.has_bailed && raw_content.contains(THINK_OPEN) {
            // The runtime marks reasoning itself; stop injecting for this run
            self.has_bailed = true;
            self.close_block(&mut text);
        }

        if !self.has_bailed && !reasoning.is_empty() && !self.has_closed {
            if !self.is_thinking {
                text.push_str(THINK_OPEN);
                self.is_thinking = true;
            }
            text.push_str(&reasoning);
        }

        if !content.is_empty() {
            self.close_block(&mut text);
            text.push_str(&content);
        }

        let mut out = delta.extra.clone();
        if !text.is_empty() {
            out.insert("content".to_string(), Value::String(text));
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Close an open reasoning block, e.g. when the run ends on reasoning
    pub fn finish(&mut self) -> Option<String> {
        let mut text = String::new();
        self.close_block(&mut text);
        (!text.is_empty()).then_some(text)
    }

    fn close_block(&mut self, text: &mut String) {
        if self.is_thinking {
            text.push_str(THINK_CLOSE);
            text.push_str(THINK_SEPARATOR);
            self.is_thinking = false;
            self.has_closed = true;
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.is_thinking
    }

    pub fn has_bailed(&self) -> bool {
        self.has_bailed
    }

    pub fn has_closed(&self) -> bool {
        self.has_closed
    }

    pub fn accumulated_content(&self) -> &str {
        &self.accumulated_content
    }

    pub fn accumulated_reasoning(&self) -> &str {
        &self.accumulated_reasoning
    }
}

/// Combine buffered reasoning and content into the final answer text
pub fn finalize(content: &str, reasoning: &str) -> String {
    if reasoning.is_empty() || content.contains(THINK_OPEN) {
        return content.to_string();
    }
    format!("{THINK_OPEN}{reasoning}{THINK_CLOSE}{THINK_SEPARATOR}{content}")
}
