// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible wire format: parsing inbound upstream event frames
//! (Layer 1 / Layer 2 of the response-acquisition pipeline) and rendering
//! outbound SSE chunks and whole-response JSON bodies for `/v1/chat/completions`.
//!
//! The inbound and outbound halves share one discipline: network chunks can
//! split a logical line across TCP segments, so every reader maintains a
//! persistent line buffer across calls and only emits on a complete `\n`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::{FinishReason, StreamEvent, ToolCall};

// ─── Inbound: upstream wire/helper frames → StreamEvent ──────────────────────

/// Drain all complete `\n`-terminated lines from `buf`, parsing each into a
/// [`StreamEvent`]. Any trailing incomplete line is left in `buf` for the next
/// chunk. Blank lines and unparseable lines are skipped rather than treated
/// as errors, since keep-alive pings share the same transport.
pub fn drain_wire_lines(buf: &mut String) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_wire_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse one upstream wire line. Lines follow an SSE-style `data: <json>`
/// envelope; the JSON payload carries whichever of `text`, `reasoningText`,
/// `functionCall`, `finishReason`, or `error` fields are present on that
/// frame. Unrecognized shapes produce no event rather than failing the
/// stream -- the wire layer must stay permissive since it sits in front of
/// an upstream the relay does not control.
fn parse_wire_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_wire_frame(&v)
}

fn parse_wire_frame(v: &Value) -> Option<StreamEvent> {
    if let Some(err) = v.get("error") {
        let detail = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Some(StreamEvent::TransportError { kind: "upstream_error".into(), detail });
    }
    if let Some(reason) = v.get("finishReason").and_then(|r| r.as_str()) {
        let finish = match reason {
            "STOP" | "stop" => FinishReason::Stop,
            "MAX_TOKENS" | "length" => FinishReason::Length,
            "SAFETY" | "RECITATION" | "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };
        return Some(StreamEvent::Finish(finish));
    }
    if let Some(call) = v.get("functionCall") {
        return Some(StreamEvent::FunctionCallChunk {
            index: call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
            id: call.get("id").and_then(|i| i.as_str()).map(str::to_string),
            name: call.get("name").and_then(|n| n.as_str()).map(str::to_string),
            arguments: call
                .get("args")
                .map(|a| a.to_string())
                .unwrap_or_default(),
        });
    }
    if let Some(text) = v.get("reasoningText").and_then(|t| t.as_str()) {
        return Some(StreamEvent::ReasoningDelta(text.to_string()));
    }
    if let Some(text) = v.get("text").and_then(|t| t.as_str()) {
        return Some(StreamEvent::TextDelta(text.to_string()));
    }
    None
}

// ─── Outbound: SSE chunk + whole-response rendering ──────────────────────────

/// One `choices[0].delta` fragment of a streaming chat completion chunk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

/// Render one streaming chunk as a complete `data: <json>\n\n` SSE frame.
pub fn render_chunk_line(req_id: &str, model: &str, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> String {
    let body = json!({
        "id": req_id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason.map(|f| f.as_wire_str()),
        }],
    });
    format!("data: {body}\n\n")
}

/// The terminal `data: [DONE]\n\n` sentinel, sent after the last content/tool
/// chunk unless the stream ended in error.
pub fn done_sentinel() -> &'static str {
    "data: [DONE]\n\n"
}

/// Render a non-streaming chat completion response body.
pub fn render_completion_body(req_id: &str, model: &str, resp: &crate::InternalResponse) -> Value {
    let tool_calls: Vec<Value> = resp
        .tool_calls
        .iter()
        .map(|tc| {
            json!({
                "id": tc.id,
                "type": "function",
                "function": { "name": tc.name, "arguments": tc.arguments },
            })
        })
        .collect();

    let mut message = json!({
        "role": "assistant",
        "content": resp.content,
    });
    if let Some(reasoning) = &resp.reasoning {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
        message["content"] = Value::Null;
    }

    json!({
        "id": req_id,
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": resp.finish_reason.map(|f| f.as_wire_str()),
        }],
        "usage": {
            "prompt_tokens": resp.usage.prompt_tokens,
            "completion_tokens": resp.usage.completion_tokens,
            "total_tokens": resp.usage.total_tokens(),
        },
    })
}

pub fn tool_call_delta_first_fragment(index: u32, tc: &ToolCall) -> ToolCallDelta {
    ToolCallDelta {
        index,
        id: Some(tc.id.clone()),
        kind: Some("function"),
        function: Some(FunctionDelta { name: Some(tc.name.clone()), arguments: tc.arguments.clone() }),
    }
}

pub fn tool_call_delta_args_fragment(index: u32, arguments: String) -> ToolCallDelta {
    ToolCallDelta { index, id: None, kind: None, function: Some(FunctionDelta { name: None, arguments }) }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_wire_lines_ignores_partial_line() {
        let mut buf = String::from("data: {\"text\":\"hi");
        let events = drain_wire_lines(&mut buf);
        assert!(events.is_empty());
        assert_eq!(buf, "data: {\"text\":\"hi");
    }

    #[test]
    fn wire_line_split_across_chunks_reassembles() {
        let mut buf = String::from("data: {\"text\":\"hi");
        assert!(drain_wire_lines(&mut buf).is_empty());
        buf.push_str("\"}\n");
        let events = drain_wire_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "hi"));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_wire_frames_in_one_chunk_all_parsed() {
        let mut buf = String::from("data: {\"text\":\"a\"}\ndata: {\"text\":\"b\"}\n");
        let events = drain_wire_lines(&mut buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn wire_finish_reason_stop_maps_correctly() {
        let v: Value = serde_json::from_str(r#"{"finishReason":"STOP"}"#).unwrap();
        let ev = parse_wire_frame(&v).unwrap();
        assert!(matches!(ev, StreamEvent::Finish(FinishReason::Stop)));
    }

    #[test]
    fn wire_function_call_frame_parses() {
        let v: Value = serde_json::from_str(
            r#"{"functionCall":{"index":0,"id":"call_1","name":"shell","args":{"cmd":"ls"}}}"#,
        )
        .unwrap();
        let ev = parse_wire_frame(&v).unwrap();
        match ev {
            StreamEvent::FunctionCallChunk { index, id, name, arguments } => {
                assert_eq!(index, 0);
                assert_eq!(id.as_deref(), Some("call_1"));
                assert_eq!(name.as_deref(), Some("shell"));
                assert!(arguments.contains("cmd"));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn wire_error_frame_becomes_transport_error() {
        let v: Value = serde_json::from_str(r#"{"error":"quota exceeded"}"#).unwrap();
        let ev = parse_wire_frame(&v).unwrap();
        assert!(matches!(ev, StreamEvent::TransportError { .. }));
    }

    #[test]
    fn render_chunk_line_has_sse_framing() {
        let line = render_chunk_line("req1", "gemini-2.5-pro", ChunkDelta { content: Some("hi".into()), ..Default::default() }, None);
        assert!(line.starts_with("data: "));
        assert!(line.ends_with("\n\n"));
        assert!(line.contains("\"content\":\"hi\""));
    }

    #[test]
    fn render_chunk_line_terminal_carries_finish_reason() {
        let line = render_chunk_line("req1", "m", ChunkDelta::default(), Some(FinishReason::Stop));
        assert!(line.contains("\"finish_reason\":\"stop\""));
    }

    #[test]
    fn done_sentinel_is_well_formed() {
        assert_eq!(done_sentinel(), "data: [DONE]\n\n");
    }

    #[test]
    fn render_completion_body_promotes_tool_calls_and_nulls_content() {
        let resp = crate::InternalResponse {
            tool_calls: vec![ToolCall { id: "call_a".into(), name: "f".into(), arguments: "{}".into() }],
            ..Default::default()
        }
        .finalize();
        let body = render_completion_body("req1", "m", &resp);
        assert_eq!(body["choices"][0]["message"]["content"], Value::Null);
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["id"], "call_a");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn render_completion_body_includes_reasoning_content_when_present() {
        let resp = crate::InternalResponse {
            content: Some("answer".into()),
            reasoning: Some("because...".into()),
            ..Default::default()
        }
        .finalize();
        let body = render_completion_body("req1", "m", &resp);
        assert_eq!(body["choices"][0]["message"]["reasoning_content"], "because...");
    }

    #[test]
    fn tool_call_delta_first_fragment_carries_name_and_id() {
        let tc = ToolCall { id: "call_x".into(), name: "grep".into(), arguments: "{\"q\":1}".into() };
        let delta = tool_call_delta_first_fragment(2, &tc);
        assert_eq!(delta.index, 2);
        assert_eq!(delta.id.as_deref(), Some("call_x"));
        assert_eq!(delta.function.unwrap().name.as_deref(), Some("grep"));
    }
}
