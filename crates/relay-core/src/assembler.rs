// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Response assembler: folds the stream of [`StreamEvent`]s observed during
//! one request into an [`InternalResponse`], and tracks what SSE deltas
//! still need to be emitted to the client as they arrive (§4.6, §6).

use relay_model::{FinishReason, InternalResponse, StreamEvent, ToolCall, UsageEstimate};
use relay_tools::CallIdManager;

/// One in-progress tool call being streamed in fragments, keyed by its
/// `index` on the wire (§4.7's `FunctionCallChunk`).
#[derive(Debug, Default, Clone)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates [`StreamEvent`]s into a final [`InternalResponse`]. The
/// worker feeds every event observed by the streaming controller through
/// [`Assembler::observe`] regardless of whether the client asked to stream;
/// a non-streaming caller just reads [`Assembler::finish`] once the
/// controller reaches a terminal state.
#[derive(Debug, Default)]
pub struct Assembler {
    content: String,
    reasoning: String,
    pending_calls: Vec<PendingCall>,
    finish_reason: Option<FinishReason>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peek at the accumulated text content without consuming the
    /// assembler (§4.7 emulated-mode parsing happens against this before
    /// [`Assembler::finish`] is called for usage bookkeeping).
    pub fn text_content(&self) -> &str {
        &self.content
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => self.content.push_str(text),
            StreamEvent::ReasoningDelta(text) => self.reasoning.push_str(text),
            StreamEvent::FunctionCallChunk { index, id, name, arguments } => {
                let idx = *index as usize;
                if self.pending_calls.len() <= idx {
                    self.pending_calls.resize_with(idx + 1, PendingCall::default);
                }
                let slot = &mut self.pending_calls[idx];
                if id.is_some() {
                    slot.id = id.clone();
                }
                if name.is_some() {
                    slot.name = name.clone();
                }
                slot.arguments.push_str(arguments);
            }
            StreamEvent::Finish(reason) => self.finish_reason = Some(*reason),
            StreamEvent::TransportError { .. } => {}
        }
    }

    /// Resolve any tool calls that arrived without a site-issued ID,
    /// minting one through `call_ids` (§4.7), and produce the final
    /// response with the tool-calls/finish-reason invariant enforced.
    pub fn finish(self, call_ids: &mut CallIdManager) -> InternalResponse {
        let tool_calls: Vec<ToolCall> = self
            .pending_calls
            .into_iter()
            .filter(|c| c.name.is_some())
            .map(|c| {
                let name = c.name.unwrap();
                let id = c.id.unwrap_or_else(|| call_ids.issue(&name, c.arguments.clone()));
                ToolCall { id, name, arguments: c.arguments }
            })
            .collect();

        InternalResponse {
            content: if self.content.is_empty() { None } else { Some(self.content) },
            reasoning: if self.reasoning.is_empty() { None } else { Some(self.reasoning) },
            tool_calls,
            finish_reason: self.finish_reason,
            usage: UsageEstimate::default(),
        }
        .finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_text_deltas_in_order() {
        let mut a = Assembler::new();
        a.observe(&StreamEvent::TextDelta("hel".into()));
        a.observe(&StreamEvent::TextDelta("lo".into()));
        let mut ids = CallIdManager::new();
        let resp = a.finish(&mut ids);
        assert_eq!(resp.content.as_deref(), Some("hello"));
    }

    #[test]
    fn assembles_fragmented_tool_call_across_chunks() {
        let mut a = Assembler::new();
        a.observe(&StreamEvent::FunctionCallChunk { index: 0, id: Some("call_abc".into()), name: Some("search".into()), arguments: "{\"q\":".into() });
        a.observe(&StreamEvent::FunctionCallChunk { index: 0, id: None, name: None, arguments: "\"rust\"}".into() });
        let mut ids = CallIdManager::new();
        let resp = a.finish(&mut ids);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(resp.tool_calls[0].id, "call_abc");
        assert_eq!(resp.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn mints_id_for_tool_call_missing_one() {
        let mut a = Assembler::new();
        a.observe(&StreamEvent::FunctionCallChunk { index: 0, id: None, name: Some("f".into()), arguments: "{}".into() });
        let mut ids = CallIdManager::new();
        let resp = a.finish(&mut ids);
        assert!(ToolCall::is_valid_id(&resp.tool_calls[0].id));
    }

    #[test]
    fn no_content_no_calls_defaults_to_stop() {
        let a = Assembler::new();
        let mut ids = CallIdManager::new();
        let resp = a.finish(&mut ids);
        assert_eq!(resp.finish_reason, Some(FinishReason::Stop));
        assert!(resp.content.is_none());
    }

    #[test]
    fn multiple_tool_calls_at_different_indices() {
        let mut a = Assembler::new();
        a.observe(&StreamEvent::FunctionCallChunk { index: 1, id: Some("call_b".into()), name: Some("b".into()), arguments: "{}".into() });
        a.observe(&StreamEvent::FunctionCallChunk { index: 0, id: Some("call_a".into()), name: Some("a".into()), arguments: "{}".into() });
        let mut ids = CallIdManager::new();
        let resp = a.finish(&mut ids);
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].name, "a");
        assert_eq!(resp.tool_calls[1].name, "b");
    }
}
