// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single FIFO request queue (§3, §4.1): every accepted HTTP request becomes
//! one [`RequestContext`] and is handed to the sole worker in arrival order.
//! There is no priority lane and no per-client fairness — ordering is the
//! entire scheduling policy (§9).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use relay_model::{ChatCompletionRequest, StreamEvent};

use crate::browser::Attachment;
use crate::cancel::CancellationToken;

/// One request accepted by the HTTP layer, stripped to what the worker
/// needs (§3). `result_sink` carries [`StreamEvent`]s back to the HTTP
/// handler regardless of whether the client asked for `stream: true` — a
/// non-streaming caller simply drains the channel to completion before
/// rendering one JSON body.
pub struct RequestContext {
    pub req_id: String,
    pub received_at: std::time::Instant,
    pub model_requested: String,
    pub stream: bool,
    pub request: ChatCompletionRequest,
    pub attachments: Vec<Attachment>,
    pub client_cancel: CancellationToken,
    pub result_sink: mpsc::UnboundedSender<StreamEvent>,
}

impl RequestContext {
    /// `collect_all_attachments` mirrors `ToolDefaultsConfig::only_collect_current_user_attachments`
    /// inverted: `false` (the default) restricts collection to the last message, `true` gathers
    /// attachments from every message in the conversation.
    pub fn from_request(
        req_id: String,
        request: ChatCompletionRequest,
        client_cancel: CancellationToken,
        collect_all_attachments: bool,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = request.stream;
        let model_requested = request.model.clone();
        let attachments = if collect_all_attachments {
            request
                .messages
                .iter()
                .flat_map(|m| m.attachments().into_iter().map(|url| Attachment { reference: url.to_string(), mime_type: None }))
                .collect()
        } else {
            request
                .messages
                .last()
                .map(|m| {
                    m.attachments()
                        .into_iter()
                        .map(|url| Attachment { reference: url.to_string(), mime_type: None })
                        .collect()
                })
                .unwrap_or_default()
        };
        (
            Self {
                req_id,
                received_at: std::time::Instant::now(),
                model_requested,
                stream,
                request,
                attachments,
                client_cancel,
                result_sink: tx,
            },
            rx,
        )
    }
}

/// Monotonically increasing arrival sequence, surfaced on `GET /v1/queue`
/// (§4.11) so clients can see their position without the worker exposing
/// any internal channel state.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Snapshot of one still-queued or in-flight request, for `GET /v1/queue`.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub req_id: String,
    pub seq: u64,
    pub model_requested: String,
    pub enqueued_ms_ago: u128,
}

/// Shared handle the HTTP layer uses to submit work and inspect queue depth;
/// the worker owns the receiving half.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<(RequestContext, u64)>,
    sequence: Arc<SequenceCounter>,
    inflight: Arc<std::sync::Mutex<HashSet<String>>>,
}

pub struct QueueWorkerEnd {
    pub receiver: mpsc::UnboundedReceiver<(RequestContext, u64)>,
}

pub fn channel() -> (QueueHandle, QueueWorkerEnd) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        QueueHandle {
            sender: tx,
            sequence: Arc::new(SequenceCounter::default()),
            inflight: Arc::new(std::sync::Mutex::new(HashSet::new())),
        },
        QueueWorkerEnd { receiver: rx },
    )
}

/// Returned to the caller immediately on submission; a client that
/// disconnects before its turn fires `cancel` and the worker skips the
/// request without ever touching the browser (§4.1 step 2).
pub struct Submission {
    pub req_id: String,
    pub seq: u64,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl QueueHandle {
    pub fn submit(&self, req_id: String, request: ChatCompletionRequest, client_cancel: CancellationToken, collect_all_attachments: bool) -> Submission {
        let seq = self.sequence.next();
        let (ctx, rx) = RequestContext::from_request(req_id.clone(), request, client_cancel, collect_all_attachments);
        self.inflight.lock().unwrap().insert(req_id.clone());
        let _ = self.sender.send((ctx, seq));
        Submission { req_id, seq, events: rx }
    }

    pub fn mark_done(&self, req_id: &str) {
        self.inflight.lock().unwrap().remove(req_id);
    }

    pub fn is_inflight(&self, req_id: &str) -> bool {
        self.inflight.lock().unwrap().contains(req_id)
    }

    /// Count of requests accepted but not yet marked done, surfaced on
    /// `GET /v1/queue` (§6). Includes the one the worker is actively
    /// processing, not just those still waiting their turn -- the worker
    /// holds no separate "currently processing" marker of its own.
    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_model::ChatCompletionRequest;

    fn empty_request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![],
            stream: false,
            tools: vec![],
            tool_choice: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            reasoning_effort: None,
            mcp_endpoint: None,
            parallel_tool_calls: None,
        }
    }

    #[tokio::test]
    async fn submissions_are_delivered_in_fifo_order() {
        let (handle, mut worker) = channel();
        handle.submit("a".into(), empty_request("m"), CancellationToken::new(), false);
        handle.submit("b".into(), empty_request("m"), CancellationToken::new(), false);
        let (first, _) = worker.receiver.recv().await.unwrap();
        let (second, _) = worker.receiver.recv().await.unwrap();
        assert_eq!(first.req_id, "a");
        assert_eq!(second.req_id, "b");
    }

    #[tokio::test]
    async fn sequence_numbers_increase_monotonically() {
        let (handle, mut worker) = channel();
        handle.submit("a".into(), empty_request("m"), CancellationToken::new(), false);
        handle.submit("b".into(), empty_request("m"), CancellationToken::new(), false);
        let (_, seq_a) = worker.receiver.recv().await.unwrap();
        let (_, seq_b) = worker.receiver.recv().await.unwrap();
        assert!(seq_b > seq_a);
    }

    #[test]
    fn inflight_tracking_round_trips() {
        let (handle, _worker) = channel();
        handle.submit("a".into(), empty_request("m"), CancellationToken::new(), false);
        assert!(handle.is_inflight("a"));
        handle.mark_done("a");
        assert!(!handle.is_inflight("a"));
    }

    #[test]
    fn len_tracks_inflight_count() {
        let (handle, _worker) = channel();
        assert_eq!(handle.len(), 0);
        handle.submit("a".into(), empty_request("m"), CancellationToken::new(), false);
        handle.submit("b".into(), empty_request("m"), CancellationToken::new(), false);
        assert_eq!(handle.len(), 2);
        handle.mark_done("a");
        assert_eq!(handle.len(), 1);
    }
}
