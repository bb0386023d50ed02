// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Out-of-process browser-driver bridge: forwards every
//! [`relay_core::browser::BrowserSession`] method as a narrow HTTP request to
//! a sidecar process that owns the actual Playwright/CDP automation (§1
//! Non-goals — the driver and the target site's DOM selectors ship
//! separately from this engine). One JSON POST per trait method; the sidecar
//! contract is intentionally thin, mirroring [`relay_mcp::McpClient`]'s
//! forwarding shape rather than inventing a richer RPC surface.
//!
//! When no endpoint is configured, [`HttpBridgeBrowserSession::is_configured`]
//! is false and every call returns [`EngineError::FatalSession`] immediately
//! — the engine still starts (queue, profiles, wire interceptor are all
//! independently testable) but cannot actually drive a session.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use relay_core::browser::{Attachment, BrowserParam, BrowserSession, UiActivity};
use relay_core::error::EngineError;

/// `{ok: true, ...}` or `{ok: false, error: "...", kind: "transient_dom"|...}`.
/// `kind` lets the sidecar distinguish a retryable DOM hiccup from a fatal
/// session loss without the bridge having to guess from an HTTP status code.
#[derive(Debug, Deserialize)]
struct BridgeEnvelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    activity: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

fn map_error_kind(kind: Option<&str>, message: String) -> EngineError {
    match kind {
        Some("transient_dom") => EngineError::TransientDom(message),
        Some("fatal_session") => EngineError::FatalSession(message),
        Some("quota") => EngineError::Quota { model: message },
        _ => EngineError::TransientDom(message),
    }
}

/// A configured (or explicitly unconfigured) browser-driver sidecar.
pub struct HttpBridgeBrowserSession {
    endpoint: Option<String>,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpBridgeBrowserSession {
    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        Self { endpoint, http: reqwest::Client::new(), timeout }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    /// POSTs `body` to `{endpoint}/{op}` and parses the common envelope.
    async fn call(&self, op: &str, body: serde_json::Value) -> Result<BridgeEnvelope, EngineError> {
        let Some(endpoint) = &self.endpoint else {
            return Err(EngineError::FatalSession("no browser-bridge endpoint configured".into()));
        };
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), op);
        debug!(op, url, "forwarding browser-driver call");

        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::BadGateway(format!("browser bridge {op} request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(EngineError::BadGateway(format!("browser bridge {op} returned status {}", resp.status())));
        }

        let envelope: BridgeEnvelope = resp
            .json()
            .await
            .map_err(|e| EngineError::BadGateway(format!("browser bridge {op} returned unparseable body: {e}")))?;

        if !envelope.ok {
            let message = envelope.error.clone().unwrap_or_else(|| format!("{op} failed with no detail"));
            warn!(op, error = %message, "browser bridge reported a failure");
            return Err(map_error_kind(envelope.kind.as_deref(), message));
        }
        Ok(envelope)
    }
}

#[derive(Serialize)]
struct EmptyBody {}

#[async_trait]
impl BrowserSession for HttpBridgeBrowserSession {
    async fn open_page(&self) -> Result<(), EngineError> {
        self.call("open-page", json!({})).await.map(|_| ())
    }

    async fn set_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.call("set-model", json!({ "model_id": model_id })).await.map(|_| ())
    }

    async fn set_parameter(&self, param: &BrowserParam) -> Result<(), EngineError> {
        let body = match param {
            BrowserParam::Temperature(v) => json!({ "param": "temperature", "value": v }),
            BrowserParam::TopP(v) => json!({ "param": "top_p", "value": v }),
            BrowserParam::MaxOutputTokens(v) => json!({ "param": "max_output_tokens", "value": v }),
            BrowserParam::StopSequences(v) => json!({ "param": "stop_sequences", "value": v }),
            BrowserParam::ReasoningLevel(v) => json!({ "param": "reasoning_level", "value": v }),
            BrowserParam::ReasoningBudget(v) => json!({ "param": "reasoning_budget", "value": v }),
            BrowserParam::GoogleSearch(v) => json!({ "param": "google_search", "value": v }),
            BrowserParam::UrlContext(v) => json!({ "param": "url_context", "value": v }),
        };
        self.call("set-parameter", body).await.map(|_| ())
    }

    async fn upload_attachment(&self, attachment: &Attachment) -> Result<(), EngineError> {
        self.call(
            "upload-attachment",
            json!({ "reference": attachment.reference, "mime_type": attachment.mime_type }),
        )
        .await
        .map(|_| ())
    }

    async fn submit_prompt(&self, prompt: &str) -> Result<(), EngineError> {
        self.call("submit-prompt", json!({ "prompt": prompt })).await.map(|_| ())
    }

    async fn poll_ui_activity(&self) -> Result<UiActivity, EngineError> {
        let envelope = self.call("poll-ui-activity", json!({})).await?;
        match envelope.activity.as_deref() {
            Some("generating") => Ok(UiActivity::Generating),
            _ => Ok(UiActivity::Idle),
        }
    }

    async fn read_final_text(&self) -> Result<String, EngineError> {
        let envelope = self.call("read-final-text", json!({})).await?;
        Ok(envelope.text.unwrap_or_default())
    }

    async fn set_function_toggle(&self, enabled: bool) -> Result<(), EngineError> {
        self.call("set-function-toggle", json!({ "enabled": enabled })).await.map(|_| ())
    }

    async fn function_toggle_state(&self) -> Result<bool, EngineError> {
        let envelope = self.call("function-toggle-state", json!({})).await?;
        Ok(envelope.enabled.unwrap_or(false))
    }

    async fn install_function_declarations(&self, canonical_json: &str) -> Result<(), EngineError> {
        self.call("install-function-declarations", json!({ "declarations": canonical_json })).await.map(|_| ())
    }

    async fn clear_chat(&self) -> Result<(), EngineError> {
        self.call("clear-chat", json!({})).await.map(|_| ())
    }

    async fn click_stop_generating(&self) -> Result<(), EngineError> {
        self.call("click-stop-generating", json!({})).await.map(|_| ())
    }

    async fn quick_refresh(&self) -> Result<(), EngineError> {
        self.call("quick-refresh", json!({})).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_bridge_refuses_every_call() {
        let session = HttpBridgeBrowserSession::new(None, Duration::from_secs(1));
        assert!(!session.is_configured());
        let err = session.open_page().await.unwrap_err();
        assert!(matches!(err, EngineError::FatalSession(_)));
    }

    #[tokio::test]
    async fn transport_failure_against_unreachable_endpoint_is_bad_gateway() {
        let session = HttpBridgeBrowserSession::new(Some("http://127.0.0.1:1".into()), Duration::from_millis(200));
        let err = session.open_page().await.unwrap_err();
        assert!(matches!(err, EngineError::BadGateway(_)));
    }

    #[test]
    fn error_kind_mapping_distinguishes_transient_from_fatal() {
        assert!(matches!(map_error_kind(Some("transient_dom"), "x".into()), EngineError::TransientDom(_)));
        assert!(matches!(map_error_kind(Some("fatal_session"), "x".into()), EngineError::FatalSession(_)));
        assert!(matches!(map_error_kind(Some("quota"), "gemini-pro".into()), EngineError::Quota { .. }));
        assert!(matches!(map_error_kind(None, "x".into()), EngineError::TransientDom(_)));
    }
}
