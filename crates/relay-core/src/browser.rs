// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Browser session facade (§4.1): a contract-only abstraction over the
//! automated browser. The actual browser-automation driver and the target
//! site's DOM selectors are out of scope (§1) — this module defines only
//! the capability interface the rest of the engine depends on, plus the
//! mutable session-state record the worker owns while holding the
//! processing lock.
//!
//! Production wiring plugs in a real Playwright/CDP-backed implementation of
//! [`BrowserSession`]; this crate ships [`NullBrowserSession`], a
//! deterministic fake used by the worker/controller test suites.

use std::collections::HashSet;

use async_trait::async_trait;
use relay_model::FunctionDeclarationsState;

use crate::error::EngineError;

/// One parameter the browser-level facade can inject (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserParam {
    Temperature(f32),
    TopP(f32),
    MaxOutputTokens(u32),
    StopSequences(Vec<String>),
    /// Site thinking-level name (e.g. `"high"`) or a raw numeric budget,
    /// already resolved by the model-capability table (§4.3).
    ReasoningLevel(String),
    ReasoningBudget(u32),
    GoogleSearch(bool),
    UrlContext(bool),
}

/// A file reference to upload alongside the live prompt (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub reference: String,
    pub mime_type: Option<String>,
}

/// Result of polling the DOM for response progress (Layer 3, §4.5, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiActivity {
    /// "Stop generating" button present, or "Run" disabled: still working.
    Generating,
    /// Neither signal present: the UI considers itself idle.
    Idle,
}

/// Contract over the automated browser session (§4.1). All methods are
/// async since every browser interaction is a suspension point (§5); the
/// processing lock the worker holds for the duration of a request is what
/// makes interleaved calls to a single implementation safe.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open_page(&self) -> Result<(), EngineError>;

    /// Idempotent: implementations may assume the caller already checked
    /// [`BrowserSessionState::current_model_id`] and skip the call entirely
    /// on a no-op switch (§4.2) — this trait method is only invoked when a
    /// switch is actually required.
    async fn set_model(&self, model_id: &str) -> Result<(), EngineError>;

    async fn set_parameter(&self, param: &BrowserParam) -> Result<(), EngineError>;

    async fn upload_attachment(&self, attachment: &Attachment) -> Result<(), EngineError>;

    /// Submits the composed prompt; returns once the site's Run/Submit
    /// button reports accepted state (§4.4).
    async fn submit_prompt(&self, prompt: &str) -> Result<(), EngineError>;

    /// Layer-3 UI-activity probe used by the silence-check snooze (§4.6),
    /// bounded by a 2000ms timeout at the call site.
    async fn poll_ui_activity(&self) -> Result<UiActivity, EngineError>;

    /// Reads the complete response text once the DOM has stabilized
    /// (Layer 3 fallback / post-hoc read, §4.5).
    async fn read_final_text(&self) -> Result<String, EngineError>;

    async fn set_function_toggle(&self, enabled: bool) -> Result<(), EngineError>;

    async fn function_toggle_state(&self) -> Result<bool, EngineError>;

    /// Opens the declarations editor, selects all, pastes `canonical_json`,
    /// saves (§4.7 native mode steps 2-3).
    async fn install_function_declarations(&self, canonical_json: &str) -> Result<(), EngineError>;

    async fn clear_chat(&self) -> Result<(), EngineError>;

    /// Best-effort; bounded by 1000ms at the call site (§4.6, §5).
    async fn click_stop_generating(&self) -> Result<(), EngineError>;

    /// Navigate-to-self + wait-for-idle, used by transient-DOM recovery
    /// (§4.1).
    async fn quick_refresh(&self) -> Result<(), EngineError>;
}

/// Mutable session-state record (§3). Only the worker may mutate this, and
/// only while holding the processing lock; the quota watchdog coordinates
/// through `model_switch_lock` in [`crate::worker::Worker`] rather than
/// touching these fields directly.
#[derive(Debug, Clone, Default)]
pub struct BrowserSessionState {
    pub page_ready: bool,
    pub connected: bool,
    pub current_model_id: Option<String>,
    pub current_param_fingerprint: Option<String>,
    pub current_function_declarations: Option<FunctionDeclarationsState>,
    pub function_toggle_enabled: bool,
}

impl BrowserSessionState {
    /// Invariant from §3: if `page_ready` is false, the adapter must not
    /// accept new requests.
    pub fn accepting_requests(&self) -> bool {
        self.page_ready
    }

    /// Force a re-switch on the next request: used after profile rotation,
    /// since a different account means the page's selected model is
    /// unknown to this process (§4.9 Commit).
    pub fn invalidate_model(&mut self) {
        self.current_model_id = None;
    }

    /// Invalidate the function-declarations cache: a different account has
    /// different UI state (§4.9 Commit), or the caller cleared/new-chatted.
    pub fn invalidate_function_declarations(&mut self) {
        self.current_function_declarations = None;
    }
}

/// Deterministic fake used by the worker and streaming-controller test
/// suites. Configurable failure injection lets tests exercise the tiered
/// recovery paths (§4.1) without a real browser.
#[derive(Debug, Default)]
pub struct NullBrowserSession {
    pub fail_submit_times: std::sync::atomic::AtomicU32,
    pub scripted_text: std::sync::Mutex<String>,
    pub scripted_tool_names: std::sync::Mutex<HashSet<String>>,
}

impl NullBrowserSession {
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            scripted_text: std::sync::Mutex::new(text.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BrowserSession for NullBrowserSession {
    async fn open_page(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_model(&self, _model_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn set_parameter(&self, _param: &BrowserParam) -> Result<(), EngineError> {
        Ok(())
    }

    async fn upload_attachment(&self, _attachment: &Attachment) -> Result<(), EngineError> {
        Ok(())
    }

    async fn submit_prompt(&self, _prompt: &str) -> Result<(), EngineError> {
        use std::sync::atomic::Ordering;
        let remaining = self.fail_submit_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submit_times.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::TransientDom("scripted failure".into()));
        }
        Ok(())
    }

    async fn poll_ui_activity(&self) -> Result<UiActivity, EngineError> {
        Ok(UiActivity::Idle)
    }

    async fn read_final_text(&self) -> Result<String, EngineError> {
        Ok(self.scripted_text.lock().unwrap().clone())
    }

    async fn set_function_toggle(&self, _enabled: bool) -> Result<(), EngineError> {
        Ok(())
    }

    async fn function_toggle_state(&self) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn install_function_declarations(&self, _canonical_json: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn clear_chat(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn click_stop_generating(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn quick_refresh(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
