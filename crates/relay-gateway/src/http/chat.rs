// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `POST /v1/chat/completions` (§6): the one request-shaped entry point.
//! Validates the request, submits it to the engine's single-lane queue,
//! then either streams the rendered SSE frames back as they arrive or
//! drains them into one whole-response JSON body, depending on the
//! client's `stream` flag.
//!
//! Disconnect-triggered cancellation (§5) rides on the streaming body's
//! own lifecycle: hyper stops polling a response body once the client
//! goes away, so a `Drop` guard around the SSE stream is enough to fire
//! the request's [`CancellationToken`] without any separate heartbeat.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use relay_core::assembler::Assembler;
use relay_core::cancel::CancellationToken;
use relay_model::{
    openai_compat::{done_sentinel, render_chunk_line, render_completion_body, ChunkDelta, FunctionDelta, ToolCallDelta},
    ChatCompletionRequest, FinishReason, StreamEvent,
};
use relay_tools::CallIdManager;

use super::models::effective_models;
use super::AppState;

/// `{code, message, type}` (§7).
fn error_body(code: &str, message: impl Into<String>) -> Value {
    json!({ "error": { "code": code, "message": message.into(), "type": code } })
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "invalid_tool" | "invalid_request" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "model_not_available" => StatusCode::UNPROCESSABLE_ENTITY,
        "client_closed_request" => StatusCode::from_u16(499).unwrap(),
        "bad_gateway" | "transient_dom_error" => StatusCode::BAD_GATEWAY,
        "rotation_exhausted" | "service_unavailable" | "rate_limited" | "quota_exceeded" => StatusCode::SERVICE_UNAVAILABLE,
        "gateway_timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(code: &str, message: impl Into<String>) -> Response {
    (status_for_code(code), Json(error_body(code, message))).into_response()
}

pub async fn chat_completions(State(state): State<AppState>, Json(request): Json<ChatCompletionRequest>) -> Response {
    if request.messages.is_empty() {
        return error_response("invalid_request", "messages must not be empty");
    }
    if !effective_models(&state.engine.config).iter().any(|id| id == &request.model) {
        return error_response("model_not_available", format!("model {:?} is not available", request.model));
    }

    let req_id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let model = request.model.clone();
    let streaming = request.stream;

    let client_cancel = CancellationToken::new();
    state.cancel_registry.lock().unwrap().insert(req_id.clone(), client_cancel.clone());

    let collect_all_attachments = !state.engine.config.tool_defaults.only_collect_current_user_attachments;
    let submission = state.engine.queue.submit(req_id.clone(), request, client_cancel.clone(), collect_all_attachments);

    if streaming {
        stream_response(state, req_id, model, client_cancel, submission.events)
    } else {
        let resp = drain_to_completion(submission.events).await;
        state.engine.queue.mark_done(&req_id);
        state.cancel_registry.lock().unwrap().remove(&req_id);
        match resp {
            DrainOutcome::Completed(internal) => Json(render_completion_body(&req_id, &model, &internal)).into_response(),
            DrainOutcome::TransportError { kind, detail } => error_response(&kind, detail),
            DrainOutcome::Cancelled => error_response("client_closed_request", "request was cancelled before completion"),
        }
    }
}

/// Distinguishes "the upstream/engine reported a real error" from "the
/// request was cancelled/disconnected before a `Finish` ever arrived" --
/// collapsing both into one `None` would misreport e.g. a `bad_gateway`
/// as `client_closed_request` on non-streaming requests.
enum DrainOutcome {
    Completed(relay_model::InternalResponse),
    TransportError { kind: String, detail: String },
    Cancelled,
}

async fn drain_to_completion(mut events: mpsc::UnboundedReceiver<StreamEvent>) -> DrainOutcome {
    let mut assembler = Assembler::new();
    let mut call_ids = CallIdManager::new();
    loop {
        match events.recv().await {
            Some(ev @ StreamEvent::Finish(_)) => {
                assembler.observe(&ev);
                return DrainOutcome::Completed(assembler.finish(&mut call_ids));
            }
            Some(StreamEvent::TransportError { kind, detail }) => {
                warn!(kind, detail, "request ended in a transport error");
                return DrainOutcome::TransportError { kind, detail };
            }
            Some(ev) => assembler.observe(&ev),
            None => return DrainOutcome::Cancelled,
        }
    }
}

/// Render the raw [`StreamEvent`] pipeline into OpenAI-shaped `data: ...`
/// SSE lines, minting a call ID for any tool-call delta the engine never
/// assigned one (§4.7, §8 invariant 6) -- the worker's own assembler only
/// mints IDs for the non-streamed `InternalResponse`, never for events
/// already forwarded live.
fn stream_response(state: AppState, req_id: String, model: String, client_cancel: CancellationToken, mut events: mpsc::UnboundedReceiver<StreamEvent>) -> Response {
    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    let req_id_for_task = req_id.clone();

    tokio::spawn(async move {
        let mut call_ids = CallIdManager::new();
        let mut id_for_index: HashMap<u32, String> = HashMap::new();

        while let Some(ev) = events.recv().await {
            match ev {
                StreamEvent::TextDelta(text) => {
                    let line = render_chunk_line(&req_id_for_task, &model, ChunkDelta { content: Some(text), ..Default::default() }, None);
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                StreamEvent::ReasoningDelta(text) => {
                    let line = render_chunk_line(&req_id_for_task, &model, ChunkDelta { reasoning_content: Some(text), ..Default::default() }, None);
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                StreamEvent::FunctionCallChunk { index, id, name, arguments } => {
                    let resolved_id = match id {
                        Some(id) => {
                            id_for_index.entry(index).or_insert_with(|| id.clone());
                            id
                        }
                        None => id_for_index
                            .entry(index)
                            .or_insert_with(|| call_ids.issue(name.clone().unwrap_or_default(), arguments.clone()))
                            .clone(),
                    };
                    let delta = ToolCallDelta {
                        index,
                        id: Some(resolved_id),
                        kind: Some("function"),
                        function: Some(FunctionDelta { name, arguments }),
                    };
                    let line = render_chunk_line(&req_id_for_task, &model, ChunkDelta { tool_calls: Some(vec![delta]), ..Default::default() }, None);
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                StreamEvent::Finish(reason) => {
                    let line = render_chunk_line(&req_id_for_task, &model, ChunkDelta::default(), Some(reason));
                    let _ = line_tx.send(line);
                    // §8 invariant 7: [DONE] only follows a genuinely terminal reason.
                    if matches!(reason, FinishReason::Stop | FinishReason::Length | FinishReason::ToolCalls) {
                        let _ = line_tx.send(done_sentinel().to_string());
                    }
                    break;
                }
                StreamEvent::TransportError { kind, detail } => {
                    warn!(kind, detail, "stream ended in a transport error");
                    let line = render_chunk_line(&req_id_for_task, &model, ChunkDelta::default(), Some(FinishReason::Error));
                    let _ = line_tx.send(line);
                    break;
                }
            }
        }
    });

    let queue = state.engine.queue.clone();
    let cancel_registry = state.cancel_registry.clone();
    let req_id_for_cleanup = req_id.clone();
    let stream = GuardedStream {
        inner: UnboundedReceiverStream::new(line_rx),
        _guard: RequestCleanupGuard {
            client_cancel,
            queue,
            cancel_registry,
            req_id: req_id_for_cleanup,
        },
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream.map_to_bytes()))
        .unwrap()
}

/// Fires the request's cancellation token and releases its bookkeeping
/// entries when the response body is dropped -- on normal completion
/// (after the last chunk is polled) or on client disconnect (hyper drops
/// the body without polling it to exhaustion).
struct RequestCleanupGuard {
    client_cancel: CancellationToken,
    queue: relay_core::queue::QueueHandle,
    cancel_registry: std::sync::Arc<std::sync::Mutex<HashMap<String, CancellationToken>>>,
    req_id: String,
}

impl Drop for RequestCleanupGuard {
    fn drop(&mut self) {
        self.client_cancel.cancel();
        self.queue.mark_done(&self.req_id);
        self.cancel_registry.lock().unwrap().remove(&self.req_id);
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: RequestCleanupGuard,
}

impl<S: Stream<Item = String> + Unpin> Stream for GuardedStream<S> {
    type Item = String;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl<S: Stream<Item = String> + Unpin> GuardedStream<S> {
    fn map_to_bytes(self) -> impl Stream<Item = Result<axum::body::Bytes, std::convert::Infallible>> {
        use futures::StreamExt;
        self.map(|line| Ok(axum::body::Bytes::from(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_for_code_maps_client_closed_to_499() {
        assert_eq!(status_for_code("client_closed_request").as_u16(), 499);
    }

    #[test]
    fn status_for_code_maps_model_not_available_to_422() {
        assert_eq!(status_for_code("model_not_available"), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn status_for_code_maps_unauthorized_to_401() {
        assert_eq!(status_for_code("unauthorized"), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn status_for_code_maps_gateway_timeout_to_504() {
        assert_eq!(status_for_code("gateway_timeout"), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn drain_to_completion_assembles_text_and_finish() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::TextDelta("hi".into())).unwrap();
        tx.send(StreamEvent::Finish(FinishReason::Stop)).unwrap();
        drop(tx);
        match drain_to_completion(rx).await {
            DrainOutcome::Completed(resp) => assert_eq!(resp.content.as_deref(), Some("hi")),
            _ => panic!("expected Completed"),
        }
    }

    #[tokio::test]
    async fn drain_to_completion_preserves_transport_error_kind() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamEvent::TransportError { kind: "bad_gateway".into(), detail: "x".into() }).unwrap();
        drop(tx);
        match drain_to_completion(rx).await {
            DrainOutcome::TransportError { kind, detail } => {
                assert_eq!(kind, "bad_gateway");
                assert_eq!(detail, "x");
            }
            _ => panic!("expected TransportError"),
        }
    }

    #[tokio::test]
    async fn drain_to_completion_reports_cancelled_on_channel_close_without_finish() {
        let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
        drop(tx);
        assert!(matches!(drain_to_completion(rx).await, DrainOutcome::Cancelled));
    }

    #[test]
    fn error_response_for_transport_error_kind_uses_its_own_status_not_client_closed() {
        let resp = error_response("bad_gateway", "upstream failed");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
