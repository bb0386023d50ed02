// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Optional MCP-forwarding plugin (§9 ambiguity resolution): a narrow
//! `{name, arguments} -> {result} | {error}` HTTP bridge for tool calls the
//! site itself doesn't recognize. This is intentionally not a general MCP
//! client — no resource/prompt primitives, no session negotiation, just
//! enough to hand an unregistered call to an external service and return
//! what comes back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum McpError {
    /// No endpoint configured (neither explicit nor `MCP_HTTP_ENDPOINT`):
    /// forwarding is refused rather than silently dropping the call.
    #[error("no MCP endpoint configured; refusing to forward tool call {0:?}")]
    NotConfigured(String),
    #[error("mcp endpoint request failed: {0}")]
    Transport(String),
    #[error("mcp endpoint returned an error: {0}")]
    Remote(String),
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    name: &'a str,
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ForwardResponse {
    Ok { result: serde_json::Value },
    Err { error: String },
}

/// A configured (or explicitly unconfigured) forwarding target.
pub struct McpClient {
    endpoint: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl McpClient {
    /// `endpoint` takes precedence; when absent, falls back to the
    /// `MCP_HTTP_ENDPOINT` environment variable (§6).
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        let endpoint = endpoint.or_else(|| std::env::var("MCP_HTTP_ENDPOINT").ok());
        Self { endpoint, http: reqwest::Client::new(), timeout }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Forward one unregistered tool call. `arguments` is the JSON-object-
    /// serialized string carried on the wire (§6) and is parsed back into a
    /// value only for the outbound request body.
    pub async fn forward(&self, name: &str, arguments: &str) -> Result<serde_json::Value, McpError> {
        let Some(endpoint) = &self.endpoint else {
            return Err(McpError::NotConfigured(name.to_string()));
        };
        let arguments: serde_json::Value = serde_json::from_str(arguments).unwrap_or(serde_json::Value::Null);

        debug!(endpoint, tool = name, "forwarding unregistered tool call");
        let resp = self
            .http
            .post(endpoint)
            .timeout(self.timeout)
            .json(&ForwardRequest { name, arguments })
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("endpoint returned status {}", resp.status())));
        }

        let parsed: ForwardResponse = resp.json().await.map_err(|e| McpError::Transport(e.to_string()))?;
        match parsed {
            ForwardResponse::Ok { result } => Ok(result),
            ForwardResponse::Err { error } => {
                warn!(tool = name, error, "mcp endpoint reported a tool error");
                Err(McpError::Remote(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_refuses_to_forward() {
        std::env::remove_var("MCP_HTTP_ENDPOINT");
        let client = McpClient::new(None, Duration::from_secs(1));
        assert!(!client.is_configured());
        let err = client.forward("anything", "{}").await.unwrap_err();
        assert!(matches!(err, McpError::NotConfigured(_)));
    }

    #[test]
    fn explicit_endpoint_takes_precedence_over_env() {
        std::env::set_var("MCP_HTTP_ENDPOINT", "http://env-endpoint.invalid");
        let client = McpClient::new(Some("http://explicit.invalid".into()), Duration::from_secs(1));
        assert_eq!(client.endpoint.as_deref(), Some("http://explicit.invalid"));
        std::env::remove_var("MCP_HTTP_ENDPOINT");
    }

    #[tokio::test]
    async fn transport_failure_against_unreachable_endpoint_is_transport_error() {
        let client = McpClient::new(Some("http://127.0.0.1:1".into()), Duration::from_millis(200));
        let err = client.forward("f", "{}").await.unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }
}
