// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Incoming OpenAI-compatible request types ─────────────────────────────────

/// A request to `POST /v1/chat/completions`, as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    /// Accepts an integer, `"none"|"low"|"medium"|"high"`, or `-1`/`"0"`.
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Non-OpenAI extension: URL to which unrecognized tool calls are forwarded.
    /// Falls back to env `MCP_HTTP_ENDPOINT` when absent.
    #[serde(default)]
    pub mcp_endpoint: Option<String>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }
}

/// `reasoning_effort` accepts either an OpenAI-style level name or a raw
/// numeric thinking budget; `-1`/`"0"` both mean "disabled".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReasoningEffort {
    Level(String),
    Numeric(i64),
}

impl ReasoningEffort {
    /// Normalize to a site thinking-level name, or `None` if disabled.
    pub fn as_level(&self) -> Option<&str> {
        match self {
            Self::Level(l) if l == "none" => None,
            Self::Level(l) => Some(l.as_str()),
            Self::Numeric(n) if *n <= 0 => None,
            Self::Numeric(_) => Some("custom"),
        }
    }

    /// Raw numeric thinking budget, if the client supplied one directly.
    pub fn as_budget(&self) -> Option<u32> {
        match self {
            Self::Numeric(n) if *n > 0 => Some(*n as u32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    /// Present on `role=tool` messages: the call this message answers.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Present on `role=assistant` messages that requested tool calls.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

impl ChatMessage {
    /// Flatten this message's content to plain text, joining text parts and
    /// dropping image parts. Used to compose the browser-submitted prompt.
    pub fn text_content(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(MessageContent::Text(t)) => t.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Collect attachment references (image URLs / data URLs) on this message.
    pub fn attachments(&self) -> Vec<&str> {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlRef },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlRef {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub function: FunctionCallPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCallPayload {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// A tool the client made available, converted by `relay_tools` into a
/// site-native `FunctionDeclaration` before submission.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolFunctionSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

// ─── Internal response model ──────────────────────────────────────────────────

/// Why a response stopped. Matches the OpenAI `finish_reason` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
        }
    }
}

/// A single resolved tool call. `arguments` is never a parsed object at the
/// API boundary -- it stays a JSON-object-serialized string end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// `true` iff `id` has the `call_` + 24 lowercase-hex-chars shape.
    pub fn is_valid_id(id: &str) -> bool {
        id.strip_prefix("call_")
            .map(|hex| hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UsageEstimate {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl UsageEstimate {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The fully-assembled result of one request, before being rendered either as
/// a single JSON body or as a terminal SSE chunk.
#[derive(Debug, Clone, Default)]
pub struct InternalResponse {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: UsageEstimate,
}

impl InternalResponse {
    /// Enforce the invariant: non-empty `tool_calls` implies
    /// `finish_reason == ToolCalls` and `content` may be absent.
    pub fn finalize(mut self) -> Self {
        if !self.tool_calls.is_empty() {
            self.finish_reason = Some(FinishReason::ToolCalls);
        } else if self.finish_reason.is_none() {
            self.finish_reason = Some(FinishReason::Stop);
        }
        self
    }
}

/// Per-session cache of the function declarations currently installed on the
/// page. Invalidated on model switch, new chat, explicit clear, or a digest
/// mismatch against the request's tool list.
#[derive(Debug, Clone)]
pub struct FunctionDeclarationsState {
    pub digest: String,
    pub tool_names: std::collections::HashSet<String>,
    pub installed_at: std::time::Instant,
}

impl FunctionDeclarationsState {
    pub fn matches(&self, digest: &str) -> bool {
        self.digest == digest
    }

    pub fn is_expired(&self, ttl: std::time::Duration) -> bool {
        !ttl.is_zero() && self.installed_at.elapsed() >= ttl
    }
}

/// A single event from the response-acquisition pipeline, regardless of
/// which layer (wire / helper / DOM) produced it.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    FunctionCallChunk {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finish(FinishReason),
    TransportError { kind: String, detail: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
