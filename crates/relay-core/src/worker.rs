// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The single worker loop (§4.1, §5): dequeues one [`RequestContext`] at a
//! time, owns the only [`BrowserSessionState`] mutation point, and applies
//! tiered error recovery (local refresh, cooldown + rotation, or fatal
//! parking) before moving on to the next request. There is exactly one
//! worker task; its exclusive possession of `state` for the duration of a
//! request *is* the processing lock (§9) — no separate mutex is needed
//! because nothing else is permitted to touch the browser concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use relay_config::{Config, ModelCapability, ThinkingCapability, ThinkingConfig, ToolDefaultsConfig};
use relay_model::{ChatMessage, FinishReason, FunctionDeclarationsState, ReasoningEffort, Role, StreamEvent, ToolDefinition};
use relay_tools::{CallIdManager, FunctionDeclaration};

use crate::assembler::Assembler;
use crate::browser::{BrowserParam, BrowserSession, BrowserSessionState};
use crate::error::EngineError;
use crate::functions::{self, ResolvedMode};
use crate::profiles::{CooldownReason, ProfilePool};
use crate::queue::{QueueWorkerEnd, RequestContext};
use crate::watchdog::DeploymentModeHandle;

/// Source of response events for one submitted prompt. Acquiring the
/// events themselves (MITM wire tap, helper poll, or DOM pseudo-stream,
/// §4.5, §4.8) is a concern of the adapter that wires a live browser in;
/// this trait is the seam the worker depends on instead.
#[async_trait]
pub trait ResponseSource: Send + Sync {
    async fn acquire(&self, req_id: &str) -> mpsc::UnboundedReceiver<StreamEvent>;
}

/// Coarse operating mode surfaced to `GET /api/info` and driven by the
/// quota watchdog (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Normal,
    QuotaExceeded,
    NeedsRotation,
    Emergency,
}

/// Lock-free snapshot of the worker's private `BrowserSessionState`,
/// published for `GET /health` (§6) without giving the HTTP layer any way
/// to touch the session itself -- only the worker ever mutates
/// `BrowserSessionState`.
#[derive(Clone, Default)]
pub struct BrowserReadinessHandle {
    page_ready: std::sync::Arc<std::sync::atomic::AtomicBool>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl BrowserReadinessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_ready(&self) -> bool {
        self.page_ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn set(&self, page_ready: bool, connected: bool) {
        self.page_ready.store(page_ready, std::sync::atomic::Ordering::Relaxed);
        self.connected.store(connected, std::sync::atomic::Ordering::Relaxed);
    }
}

const MAX_ROTATION_ATTEMPTS_PER_REQUEST: u32 = 1;

pub struct Worker<B: BrowserSession, R: ResponseSource> {
    queue: QueueWorkerEnd,
    browser: Arc<B>,
    response_source: Arc<R>,
    config: Arc<Config>,
    profiles: Option<Arc<Mutex<ProfilePool>>>,
    current_profile: Option<String>,
    state: BrowserSessionState,
    native_failures: HashMap<String, u32>,
    last_finished_at: Option<std::time::Instant>,
    last_was_streaming: bool,
    readiness: BrowserReadinessHandle,
    deployment_mode: Option<DeploymentModeHandle>,
    mcp: Arc<relay_mcp::McpClient>,
}

impl<B: BrowserSession, R: ResponseSource> Worker<B, R> {
    pub fn new(
        queue: QueueWorkerEnd,
        browser: Arc<B>,
        response_source: Arc<R>,
        config: Arc<Config>,
        profiles: Option<Arc<Mutex<ProfilePool>>>,
    ) -> Self {
        Self::with_readiness(queue, browser, response_source, config, profiles, BrowserReadinessHandle::new())
    }

    pub fn with_readiness(
        queue: QueueWorkerEnd,
        browser: Arc<B>,
        response_source: Arc<R>,
        config: Arc<Config>,
        profiles: Option<Arc<Mutex<ProfilePool>>>,
        readiness: BrowserReadinessHandle,
    ) -> Self {
        let mcp = Arc::new(relay_mcp::McpClient::new(config.mcp.endpoint.clone(), Duration::from_millis(config.mcp.request_timeout_ms)));
        Self {
            queue,
            browser,
            response_source,
            config,
            profiles,
            current_profile: None,
            state: BrowserSessionState::default(),
            native_failures: HashMap::new(),
            last_finished_at: None,
            last_was_streaming: false,
            readiness,
            deployment_mode: None,
            mcp,
        }
    }

    /// Attach the watchdog's shared mode handle (§4.1 step 3, §4.10) so the
    /// dequeue loop suspends itself while the pool is degraded instead of
    /// discovering the same thing request-by-request through errors.
    pub fn with_deployment_mode(mut self, handle: DeploymentModeHandle) -> Self {
        self.deployment_mode = Some(handle);
        self
    }

    pub fn readiness_handle(&self) -> BrowserReadinessHandle {
        self.readiness.clone()
    }

    /// Drive the queue to exhaustion (or a fatal session error). Returns
    /// `Ok(())` if the queue closed normally, `Err` if a fatal browser error
    /// parked the worker — the caller decides whether to rebuild the
    /// browser session and start a fresh [`Worker`].
    pub async fn run(&mut self) -> Result<(), EngineError> {
        loop {
            self.wait_while_degraded().await;

            let Some((ctx, _seq)) = self.queue.receiver.recv().await else { break };
            self.smart_delay_if_needed(&ctx).await;

            if ctx.client_cancel.is_cancelled() {
                info!(req_id = %ctx.req_id, "skipping request cancelled before dequeue");
                continue;
            }

            self.last_was_streaming = ctx.stream;
            if let Err(fatal) = self.process_one(ctx).await {
                error!(error = %fatal, "worker parking on fatal session error");
                self.readiness.set(false, false);
                return Err(fatal);
            }
            self.last_finished_at = Some(std::time::Instant::now());
        }
        Ok(())
    }

    /// Block the dequeue loop while the watchdog reports `QuotaExceeded` or
    /// `NeedsRotation` (§4.1 step 3), retrying rotation every few seconds
    /// until either a fresh profile is found or the mode recovers on its
    /// own. A no-op when no deployment-mode handle is attached (e.g. a
    /// profile-less single-session deployment) or the pool is healthy.
    async fn wait_while_degraded(&mut self) {
        loop {
            let Some(handle) = self.deployment_mode.clone() else { return };
            let mode = handle.get();
            if !matches!(mode, DeploymentMode::QuotaExceeded | DeploymentMode::NeedsRotation) {
                return;
            }
            warn!(?mode, "deployment degraded, suspending dequeue and attempting rotation");
            if self.rotate_due_to_degraded_mode().await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Rotate to any eligible profile, without first applying a cooldown to
    /// the current one — the watchdog's periodic scan already reflects
    /// cooldowns applied elsewhere, this is just picking a candidate.
    async fn rotate_due_to_degraded_mode(&mut self) -> Result<(), EngineError> {
        let Some(pool) = &self.profiles else { return Err(EngineError::RotationExhausted) };
        let mut pool = pool.lock().await;
        let canary_cooldown_s = self.config.cooldowns.canary_cooldown_s;
        let result = crate::profiles::rotate(&mut pool, None, canary_cooldown_s, |_candidate| async { Ok(()) }).await?;
        self.current_profile = Some(result.profile_id);
        self.state.invalidate_model();
        self.state.invalidate_function_declarations();
        Ok(())
    }

    async fn smart_delay_if_needed(&self, ctx: &RequestContext) {
        if let Some(last) = self.last_finished_at {
            let gap = std::time::Instant::now().saturating_duration_since(last);
            if self.last_was_streaming && ctx.stream && gap < Duration::from_secs(1) {
                let ms = rand::thread_rng().gen_range(500..=1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
    }

    async fn process_one(&mut self, ctx: RequestContext) -> Result<(), EngineError> {
        let req_id = ctx.req_id.clone();
        let model = ctx.model_requested.clone();

        if let Err(e) = self.ensure_page_ready().await {
            self.emit_error(&ctx, &e);
            return Err(e);
        }

        let mut rotation_attempts = 0;
        let mut emulated_declarations = None;
        loop {
            match self.submit_and_prepare(&ctx, &model).await {
                Ok(declarations) => {
                    emulated_declarations = declarations;
                    break;
                }
                Err(e) if e.retryable() && rotation_attempts < MAX_ROTATION_ATTEMPTS_PER_REQUEST => {
                    rotation_attempts += 1;
                    match self.recover(&e, &model).await {
                        Ok(()) => continue,
                        Err(unrecoverable) => {
                            self.emit_error(&ctx, &unrecoverable);
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    self.emit_error(&ctx, &e);
                    return if matches!(e, EngineError::FatalSession(_)) { Err(e) } else { Ok(()) };
                }
            }
        }

        let events = self.response_source.acquire(&req_id).await;
        let mut assembler = Assembler::new();
        let sink = ctx.result_sink.clone();
        // Emulated-mode tool calls ride inside the plain response text
        // (§4.7) -- the marker must never reach the client verbatim, so
        // live forwarding is suppressed until the whole text is in and can
        // be parsed (this request's deltas are effectively pseudo-streamed
        // once, same as a Layer-3 DOM response, §4.5).
        let suppress_live_forward = emulated_declarations.is_some();
        let terminal = crate::stream_controller::drive(
            events,
            self.browser.as_ref(),
            &ctx.client_cancel,
            Duration::from_millis(self.config.timing.ttfb_budget_ms()),
            Duration::from_millis(self.config.timing.silence_budget_ms()),
            Duration::from_millis(self.config.timing.hard_cap_ms()),
            |ev| {
                assembler.observe(ev);
                if !suppress_live_forward {
                    let _ = sink.send(ev.clone());
                }
            },
        )
        .await;

        use crate::stream_controller::TerminalState;
        match terminal {
            TerminalState::Completed(reason) => {
                let mut call_ids = CallIdManager::new();
                if let Some(declarations) = &emulated_declarations {
                    self.forward_emulated_completion(&ctx, &assembler, declarations, reason, &mut call_ids).await;
                }
                let final_response = assembler.finish(&mut call_ids);
                self.record_usage(&final_response).await;
            }
            TerminalState::TtfbTimeout | TerminalState::StaleTimeout => {
                let _ = ctx.result_sink.send(StreamEvent::TransportError {
                    kind: "gateway_timeout".into(),
                    detail: "no response observed within budget".into(),
                });
            }
            TerminalState::Cancelled => {
                info!(req_id = %req_id, "request cancelled mid-stream");
                // Best-effort stop-button click (§4.6): the browser driver is out of
                // scope here, so this is bounded so a wedged click never holds up
                // the next queued request.
                let _ = tokio::time::timeout(Duration::from_millis(1000), self.browser.click_stop_generating()).await;
            }
            TerminalState::Error(detail) => {
                let _ = ctx.result_sink.send(StreamEvent::TransportError { kind: "bad_gateway".into(), detail });
            }
        }

        self.cleanup_after_request();
        Ok(())
    }

    async fn ensure_page_ready(&mut self) -> Result<(), EngineError> {
        if self.state.page_ready {
            return Ok(());
        }
        self.browser.open_page().await.map_err(|_| EngineError::FatalSession("failed to open page".into()))?;
        self.state.page_ready = true;
        self.state.connected = true;
        self.readiness.set(true, true);
        Ok(())
    }

    /// Model switch, parameter sync, function-declarations setup, and
    /// prompt submission (§4.1 steps 3-5, §4.2, §4.3, §4.7). Returns the
    /// emulated-mode tool catalog if that's the strategy this request
    /// resolved to -- `None` for native mode (tool calls arrive as wire/DOM
    /// `FunctionCallChunk`s instead) or when no tools were requested.
    async fn submit_and_prepare(&mut self, ctx: &RequestContext, model: &str) -> Result<Option<Vec<FunctionDeclaration>>, EngineError> {
        if self.state.current_model_id.as_deref() != Some(model) {
            self.browser.set_model(model).await?;
            self.state.current_model_id = Some(model.to_string());
            self.state.current_param_fingerprint = None;
        }

        self.sync_parameters(ctx, model).await?;

        let (prompt, emulated_declarations) = self.prepare_prompt_and_functions(ctx, model).await?;

        for attachment in &ctx.attachments {
            self.browser.upload_attachment(attachment).await?;
        }

        self.browser.submit_prompt(&prompt).await?;
        Ok(emulated_declarations)
    }

    async fn sync_parameters(&mut self, ctx: &RequestContext, model: &str) -> Result<(), EngineError> {
        let thinking_param = resolve_thinking_param(
            model,
            &self.config.model_capabilities,
            &self.config.thinking,
            ctx.request.reasoning_effort.as_ref(),
        );
        // Built-in tool toggles are only defaulted from config when the
        // request carries no `tools` array (§4.3, §6) -- once tools are
        // present, `prepare_prompt_and_functions` owns google_search/
        // url_context (native mode must disable both, §4.7).
        let tool_defaults = ctx
            .request
            .tools
            .is_empty()
            .then(|| resolve_tool_defaults(model, &self.config.model_capabilities, &self.config.tool_defaults));

        let fingerprint = format!(
            "{:?}/{:?}/{:?}/{:?}/{:?}/{:?}",
            ctx.request.temperature,
            ctx.request.top_p,
            ctx.request.max_tokens,
            ctx.request.stop.as_ref().map(|s| s.as_vec()),
            thinking_param,
            tool_defaults,
        );
        if self.state.current_param_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(());
        }
        if let Some(t) = ctx.request.temperature {
            self.browser.set_parameter(&BrowserParam::Temperature(t)).await?;
        }
        if let Some(p) = ctx.request.top_p {
            self.browser.set_parameter(&BrowserParam::TopP(p)).await?;
        }
        if let Some(m) = ctx.request.max_tokens {
            self.browser.set_parameter(&BrowserParam::MaxOutputTokens(m)).await?;
        }
        if let Some(stop) = &ctx.request.stop {
            self.browser.set_parameter(&BrowserParam::StopSequences(stop.as_vec())).await?;
        }
        if let Some(param) = &thinking_param {
            self.browser.set_parameter(param).await?;
        }
        if let Some((google_search, url_context)) = tool_defaults {
            self.browser.set_parameter(&BrowserParam::GoogleSearch(google_search)).await?;
            self.browser.set_parameter(&BrowserParam::UrlContext(url_context)).await?;
        }
        self.state.current_param_fingerprint = Some(fingerprint);
        Ok(())
    }

    async fn prepare_prompt_and_functions(&mut self, ctx: &RequestContext, model: &str) -> Result<(String, Option<Vec<FunctionDeclaration>>), EngineError> {
        let base_text = compose_prompt(&ctx.request.messages);

        let tools: &[ToolDefinition] = &ctx.request.tools;
        if tools.is_empty() {
            if self.state.function_toggle_enabled {
                self.browser.set_function_toggle(false).await?;
                self.state.function_toggle_enabled = false;
                self.state.invalidate_function_declarations();
            }
            return Ok((base_text, None));
        }

        let prepared = functions::prepare(tools).map_err(|e| EngineError::InvalidTool(e.to_string()))?;
        let failures = *self.native_failures.get(model).unwrap_or(&0);
        let mode = functions::resolve_mode(self.config.function_calling.mode, failures, self.config.function_calling.native_retry_count);

        match mode {
            ResolvedMode::Native => {
                if functions::native_requires_disabling_builtin_tools(mode, !prepared.declarations.is_empty()) {
                    self.browser.set_parameter(&BrowserParam::GoogleSearch(false)).await?;
                    self.browser.set_parameter(&BrowserParam::UrlContext(false)).await?;
                }
                let needs_install = functions::needs_install(
                    self.state.current_function_declarations.as_ref(),
                    &prepared.digest,
                    &self.config.function_calling,
                );
                if needs_install {
                    let canonical = relay_tools::canonical_json(&prepared.declarations);
                    self.browser.install_function_declarations(&canonical).await?;
                    self.state.current_function_declarations = Some(FunctionDeclarationsState {
                        digest: prepared.digest.clone(),
                        tool_names: prepared.declarations.iter().map(|d| d.name.clone()).collect(),
                        installed_at: std::time::Instant::now(),
                    });
                }
                if !self.state.function_toggle_enabled {
                    self.browser.set_function_toggle(true).await?;
                    self.state.function_toggle_enabled = true;
                }
                Ok((base_text, None))
            }
            ResolvedMode::Emulated => {
                if self.state.function_toggle_enabled {
                    self.browser.set_function_toggle(false).await?;
                    self.state.function_toggle_enabled = false;
                }
                let catalog = functions::build_emulated_catalog(&prepared.declarations);
                Ok((format!("{catalog}\n{base_text}"), Some(prepared.declarations)))
            }
        }
    }

    /// Tiered recovery for a retryable [`EngineError`] (§4.1, §4.9): one
    /// local refresh for transient DOM errors, cooldown + rotation for
    /// quota/rate-limit errors.
    async fn recover(&mut self, err: &EngineError, model: &str) -> Result<(), EngineError> {
        match err {
            EngineError::TransientDom(_) => {
                warn!("transient DOM error, attempting a quick refresh");
                self.browser.quick_refresh().await.map_err(|_| EngineError::FatalSession("refresh failed".into()))?;
                self.state = BrowserSessionState { page_ready: true, connected: true, ..Default::default() };
                self.readiness.set(true, true);
                Ok(())
            }
            EngineError::Quota { model: exhausted_model } => {
                self.apply_cooldown_and_rotate(CooldownReason::QuotaExceeded, Some(exhausted_model.as_str()), self.config.cooldowns.quota_exceeded_cooldown_s)
                    .await
            }
            EngineError::RateLimit => {
                self.apply_cooldown_and_rotate(CooldownReason::RateLimit, None, self.config.cooldowns.rate_limit_cooldown_s).await
            }
            other => Err(other.clone()),
        }
        .map(|()| {
            if let EngineError::Quota { .. } = err {
                *self.native_failures.entry(model.to_string()).or_insert(0) += 1;
            }
        })
    }

    async fn apply_cooldown_and_rotate(&mut self, reason: CooldownReason, model: Option<&str>, duration_s: u64) -> Result<(), EngineError> {
        let Some(pool) = &self.profiles else {
            return Err(EngineError::RotationExhausted);
        };
        let mut pool = pool.lock().await;
        if let Some(profile_id) = &self.current_profile {
            let _ = pool.apply_cooldown(profile_id, reason, model, duration_s);
        }
        let canary_cooldown_s = self.config.cooldowns.canary_cooldown_s;
        let result = crate::profiles::rotate(&mut pool, model, canary_cooldown_s, |_candidate| async { Ok(()) }).await?;
        self.current_profile = Some(result.profile_id);
        self.state.invalidate_model();
        self.state.invalidate_function_declarations();
        Ok(())
    }

    /// Credits the current profile's usage ledger with a rough token estimate
    /// (no tokenizer is wired in; this is a chars/4 heuristic, same order of
    /// magnitude as the real thing and good enough for wear-leveling, §4.9).
    /// A no-op when no profile pool is configured.
    async fn record_usage(&self, response: &relay_model::InternalResponse) {
        let Some(pool) = &self.profiles else { return };
        let Some(profile_id) = &self.current_profile else { return };
        let completion_chars = response.content.as_deref().map_or(0, str::len)
            + response.reasoning.as_deref().map_or(0, str::len)
            + response.tool_calls.iter().map(|c| c.arguments.len()).sum::<usize>();
        let tokens = (completion_chars as u64 / 4).max(1);
        let mut pool = pool.lock().await;
        if let Err(e) = pool.record_usage(profile_id, tokens) {
            warn!(error = %e, "failed to persist profile usage ledger");
        }
    }

    fn cleanup_after_request(&mut self) {
        if self.config.function_calling.clear_between_requests {
            self.state.invalidate_function_declarations();
            self.state.function_toggle_enabled = false;
        }
    }

    fn emit_error(&self, ctx: &RequestContext, err: &EngineError) {
        let _ = ctx.result_sink.send(StreamEvent::TransportError { kind: err.code().to_string(), detail: err.to_string() });
    }

    /// Parse the fully-assembled emulated-mode text for the "Request
    /// function call: ..." marker (§4.7) and forward the result to the
    /// request's sink as the single chunk a suppressed live stream owes
    /// the client: either one `FunctionCallChunk` + `Finish(ToolCalls)`,
    /// or the plain text as one `TextDelta` + the original finish reason.
    ///
    /// A marker whose name doesn't fuzzy-match any tool the client declared
    /// is not necessarily a mistake -- the site may be invoking something
    /// the client never listed. Rather than failing the request outright,
    /// such calls are handed to the optional MCP-forwarding plugin (§9) when
    /// one is configured; its result is folded back into the answer as plain
    /// text, since there is no client-declared tool to attach it to.
    async fn forward_emulated_completion(
        &self,
        ctx: &RequestContext,
        assembler: &Assembler,
        declarations: &[FunctionDeclaration],
        reason: FinishReason,
        call_ids: &mut CallIdManager,
    ) {
        let text = assembler.text_content().to_string();
        let threshold = self.config.function_calling.fuzzy_match_threshold;

        let Some(parsed) = relay_tools::parse_emulated_call(&text) else {
            if !text.is_empty() {
                let _ = ctx.result_sink.send(StreamEvent::TextDelta(text));
            }
            let _ = ctx.result_sink.send(StreamEvent::Finish(reason));
            return;
        };

        let known_names: Vec<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
        if relay_tools::parser::fuzzy_match_name(&parsed.name, known_names, threshold).is_some() {
            match functions::parse_emulated_response(&text, declarations, threshold, call_ids) {
                Ok(Some(call)) => {
                    let _ = ctx.result_sink.send(StreamEvent::FunctionCallChunk {
                        index: 0,
                        id: Some(call.id),
                        name: Some(call.name),
                        arguments: call.arguments,
                    });
                    let _ = ctx.result_sink.send(StreamEvent::Finish(FinishReason::ToolCalls));
                }
                Ok(None) => unreachable!("a marker was just found"),
                Err(e) => self.emit_error(ctx, &e),
            }
            return;
        }

        self.forward_unmatched_call_via_mcp(ctx, &parsed.name, &parsed.arguments, reason).await;
    }

    /// Forward an emulated-mode call whose name matched nothing the client
    /// declared to the MCP plugin, when one is configured (§9). A
    /// per-request `mcp_endpoint` override on the request takes precedence
    /// over the configured default, matching the declarations-cache's
    /// per-request scoping elsewhere in this module.
    async fn forward_unmatched_call_via_mcp(&self, ctx: &RequestContext, name: &str, arguments: &str, reason: FinishReason) {
        let timeout = Duration::from_millis(self.config.mcp.request_timeout_ms);
        let override_client;
        let client: &relay_mcp::McpClient = match &ctx.request.mcp_endpoint {
            Some(endpoint) => {
                override_client = relay_mcp::McpClient::new(Some(endpoint.clone()), timeout);
                &override_client
            }
            None => self.mcp.as_ref(),
        };

        if !client.is_configured() {
            self.emit_error(ctx, &EngineError::InvalidTool(name.to_string()));
            return;
        }

        match client.forward(name, arguments).await {
            Ok(result) => {
                let _ = ctx.result_sink.send(StreamEvent::TextDelta(result.to_string()));
                let _ = ctx.result_sink.send(StreamEvent::Finish(reason));
            }
            Err(e) => self.emit_error(ctx, &EngineError::BadGateway(e.to_string())),
        }
    }
}

/// Compose the browser-submitted prompt text from the whole message list
/// (§4.4): the last message is the live prompt, everything before it is
/// serialized into a context block that precedes it. Assistant replies and
/// tool-result messages are both included -- a `role=tool` message renders
/// as `Tool result (tool_call_id=...): <content>` so the model sees which
/// call each result answers.
fn compose_prompt(messages: &[ChatMessage]) -> String {
    let Some((live, history)) = messages.split_last() else {
        return String::new();
    };
    let live_text = live.text_content();
    if history.is_empty() {
        return live_text;
    }
    let context_block = history.iter().map(render_context_message).collect::<Vec<_>>().join("\n");
    format!("{context_block}\n{live_text}")
}

fn render_context_message(msg: &ChatMessage) -> String {
    let text = msg.text_content();
    match msg.role {
        Role::Tool => {
            let call_id = msg.tool_call_id.as_deref().unwrap_or("unknown");
            format!("Tool result (tool_call_id={call_id}): {text}")
        }
        Role::System => format!("System: {text}"),
        Role::User => format!("User: {text}"),
        Role::Assistant => format!("Assistant: {text}"),
    }
}

/// `*`-only wildcard match against a model id (§4.3 capability table
/// patterns, e.g. `"*-pro*"`). No other glob metacharacters are recognized.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let (mut star, mut star_ti) = (None, 0);
    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == b'*' || pattern[pi] == text[ti]) {
            if pattern[pi] == b'*' {
                star = Some(pi);
                star_ti = ti;
                pi += 1;
            } else {
                pi += 1;
                ti += 1;
            }
        } else if let Some(sp) = star {
            pi = sp + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == b'*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// First capability-table entry whose pattern matches `model` (§4.3: "first
/// matching pattern wins").
fn capability_for<'a>(model: &str, capabilities: &'a [ModelCapability]) -> Option<&'a ModelCapability> {
    capabilities.iter().find(|c| glob_match(&c.pattern, model))
}

/// Model-id heuristic used to pick between the pro/flash thinking-level
/// defaults (§6) when a `Levels`-mode model wasn't given an explicit effort.
fn default_thinking_level(model: &str, thinking: &ThinkingConfig) -> String {
    if model.contains("pro") {
        thinking.default_thinking_level_pro.clone()
    } else {
        thinking.default_thinking_level_flash.clone()
    }
}

/// Resolve the browser-level thinking control for `model` against the
/// capability table and the configured thinking defaults (§4.3, §6). `None`
/// means the model declares no thinking support, or thinking defaults are
/// disabled and the client supplied no explicit effort.
fn resolve_thinking_param(
    model: &str,
    capabilities: &[ModelCapability],
    thinking: &ThinkingConfig,
    reasoning_effort: Option<&ReasoningEffort>,
) -> Option<BrowserParam> {
    let capability = capability_for(model, capabilities).map(|c| c.thinking.clone()).unwrap_or_default();
    match capability {
        ThinkingCapability::None => None,
        ThinkingCapability::Levels { .. } => {
            let level = match reasoning_effort.and_then(ReasoningEffort::as_level) {
                Some(level) => level.to_string(),
                None if thinking.enable_thinking_budget => default_thinking_level(model, thinking),
                None => return None,
            };
            Some(BrowserParam::ReasoningLevel(level))
        }
        ThinkingCapability::Budget { min, max } => {
            let budget = match reasoning_effort.and_then(ReasoningEffort::as_budget) {
                Some(budget) => budget,
                None if thinking.enable_thinking_budget => thinking.default_thinking_budget,
                None => return None,
            };
            Some(BrowserParam::ReasoningBudget(budget.clamp(min, max)))
        }
    }
}

/// Default `google_search`/`url_context` toggles applied when a request
/// carries no `tools` array (§4.3, §6); `google_search` is further gated by
/// the matched capability's `supports_google_search` flag.
fn resolve_tool_defaults(model: &str, capabilities: &[ModelCapability], tool_defaults: &ToolDefaultsConfig) -> (bool, bool) {
    let supports_google_search = capability_for(model, capabilities).map(|c| c.supports_google_search).unwrap_or(true);
    let google_search = tool_defaults.enable_google_search && supports_google_search;
    (google_search, tool_defaults.enable_url_context)
}
