// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_response_completion_timeout_ms() -> u64 {
    120_000
}

fn default_silence_timeout_default_ms() -> u64 {
    30_000
}

fn default_pseudo_stream_delay_s() -> f64 {
    0.25
}

/// Timing budgets for the streaming lifecycle controller.
///
/// `ttfb_timeout_ms` is `None` by default — callers should derive it from
/// `response_completion_timeout_ms` rather than hardcode a second magic
/// number here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Total per-request browser-interaction timeout, in milliseconds.
    pub response_completion_timeout_ms: u64,
    /// Floor for the silence budget, in milliseconds.
    pub silence_timeout_default_ms: u64,
    /// TTFB budget in milliseconds. `None` derives it from
    /// `response_completion_timeout_ms`.
    pub ttfb_timeout_ms: Option<u64>,
    /// Inter-chunk delay for Layer-3 pseudo-streaming, in seconds.
    pub pseudo_stream_delay_s: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_completion_timeout_ms: default_response_completion_timeout_ms(),
            silence_timeout_default_ms: default_silence_timeout_default_ms(),
            ttfb_timeout_ms: None,
            pseudo_stream_delay_s: default_pseudo_stream_delay_s(),
        }
    }
}

impl TimingConfig {
    /// The effective TTFB budget: explicit value if set, otherwise one third
    /// of the total completion timeout.
    pub fn ttfb_budget_ms(&self) -> u64 {
        self.ttfb_timeout_ms
            .unwrap_or(self.response_completion_timeout_ms / 3)
    }

    /// Silence budget: never smaller than the TTFB budget, floored at
    /// `silence_timeout_default_ms`, and never exceeding
    /// `3 * response_completion_timeout_ms` (the hard cap from §4.6).
    pub fn silence_budget_ms(&self) -> u64 {
        let floor = self
            .silence_timeout_default_ms
            .max(self.response_completion_timeout_ms / 2);
        let budget = floor.max(self.ttfb_budget_ms());
        budget.min(3 * self.response_completion_timeout_ms)
    }

    /// Absolute hard cap on one request's streaming lifecycle (§4.6): once
    /// elapsed, the controller forces `StaleTimeout` regardless of how
    /// recently the UI reported activity.
    pub fn hard_cap_ms(&self) -> u64 {
        3 * self.response_completion_timeout_ms
    }
}

/// `function_calling.mode` — §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCallingMode {
    Emulated,
    Native,
    #[default]
    Auto,
}

fn default_native_retry_count() -> u32 {
    2
}
fn default_ui_timeout_ms() -> u64 {
    5_000
}
fn default_fuzzy_match_threshold() -> f64 {
    0.70
}

/// Function-calling orchestrator tunables (§4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FunctionCallingConfig {
    pub mode: FunctionCallingMode,
    /// Enables the `FunctionDeclarationsState` digest cache.
    pub cache_enabled: bool,
    /// 0 = no expiry; otherwise seconds.
    pub cache_ttl_s: u64,
    /// Force-clear declarations after every request.
    ///
    /// Defaults to `false`: a cache hit is supposed to skip both the UI clear
    /// and the re-install. Set to `true` to force a clear after every request
    /// regardless of cache state.
    pub clear_between_requests: bool,
    /// Retries before falling back from native to emulated mode.
    pub native_retry_count: u32,
    /// UI-operation timeout for declarations setup, in milliseconds.
    pub ui_timeout_ms: u64,
    /// Prefix-length fraction (of the shorter name) required for the
    /// truncated-tool-name fuzzy match in emulated-mode parsing (§4.7, §9).
    pub fuzzy_match_threshold: f64,
}

impl Default for FunctionCallingConfig {
    fn default() -> Self {
        Self {
            mode: FunctionCallingMode::default(),
            cache_enabled: true,
            cache_ttl_s: 0,
            clear_between_requests: false,
            native_retry_count: default_native_retry_count(),
            ui_timeout_ms: default_ui_timeout_ms(),
            fuzzy_match_threshold: default_fuzzy_match_threshold(),
        }
    }
}

fn default_stream_port() -> u16 {
    8081
}

/// Response-acquisition pipeline configuration (§4.5, §4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamProxyConfig {
    /// Local MITM proxy port. `0` disables Layer 1.
    pub stream_port: u16,
    /// Layer-2 helper endpoint URL. `None` disables Layer 2.
    pub helper_endpoint: Option<String>,
    /// Directory holding `ca.crt` / `ca.key` and cached per-host leaf certs.
    pub certs_dir: PathBuf,
}

impl Default for StreamProxyConfig {
    fn default() -> Self {
        Self {
            stream_port: default_stream_port(),
            helper_endpoint: None,
            certs_dir: default_certs_dir(),
        }
    }
}

fn default_certs_dir() -> PathBuf {
    default_state_dir().join("certs")
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/aistudio-relay")
}

fn default_thinking_budget() -> u32 {
    8192
}

/// Thinking/reasoning-effort defaults (§6) used when a request omits
/// `reasoning_effort`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThinkingConfig {
    pub enable_thinking_budget: bool,
    pub default_thinking_budget: u32,
    pub default_thinking_level_pro: String,
    pub default_thinking_level_flash: String,
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            enable_thinking_budget: true,
            default_thinking_budget: default_thinking_budget(),
            default_thinking_level_pro: "high".to_string(),
            default_thinking_level_flash: "medium".to_string(),
        }
    }
}

/// Default tool-toggle behavior when a request omits `tools` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolDefaultsConfig {
    pub enable_google_search: bool,
    pub enable_url_context: bool,
    /// If true, only the last user message's attachments are uploaded (§4.4).
    pub only_collect_current_user_attachments: bool,
}

impl Default for ToolDefaultsConfig {
    fn default() -> Self {
        Self {
            enable_google_search: false,
            enable_url_context: false,
            only_collect_current_user_attachments: true,
        }
    }
}

fn default_rate_limit_cooldown_s() -> u64 {
    300
}
fn default_quota_exceeded_cooldown_s() -> u64 {
    3_600
}
fn default_canary_cooldown_s() -> u64 {
    300
}

/// Cooldown durations (§4.9, §6) applied by the profile-rotation subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CooldownConfig {
    pub rate_limit_cooldown_s: u64,
    pub quota_exceeded_cooldown_s: u64,
    pub canary_cooldown_s: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_s: default_rate_limit_cooldown_s(),
            quota_exceeded_cooldown_s: default_quota_exceeded_cooldown_s(),
            canary_cooldown_s: default_canary_cooldown_s(),
        }
    }
}

/// Location of the on-disk profile pool and persisted ledgers (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Parent of `primary/`, `active/`, `emergency/` profile-blob directories.
    pub dir: PathBuf,
    /// Path to the cooldown ledger (`cooldown_status.json`).
    pub cooldown_ledger_path: PathBuf,
    /// Path to the usage ledger (`profile_usage.json`).
    pub usage_ledger_path: PathBuf,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        let dir = default_state_dir().join("auth_profiles");
        let cfg_dir = default_state_dir().join("config");
        Self {
            dir,
            cooldown_ledger_path: cfg_dir.join("cooldown_status.json"),
            usage_ledger_path: cfg_dir.join("profile_usage.json"),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// HTTP surface configuration — the public API adapter's ambient stack (§4.11, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    /// Path to the API-key text file (§6 Authentication). `None` ⇒ open access.
    pub api_keys_file: Option<PathBuf>,
    /// Skip TLS and serve plain HTTP — local development only.
    pub insecure_dev_mode: bool,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    /// Failed-auth attempts per minute before an IP is locked out.
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys_file: None,
            insecure_dev_mode: true,
            tls_cert_file: None,
            tls_key_file: None,
            rate_limit_per_minute: 5,
            rate_limit_burst: 2,
        }
    }
}

/// Optional MCP-forwarding plugin configuration (§9 ambiguity resolution).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct McpConfig {
    /// Endpoint unknown tool calls are forwarded to. Falls back to the
    /// `MCP_HTTP_ENDPOINT` environment variable; unset ⇒ unknown tool calls
    /// are rejected rather than silently dropped.
    pub endpoint: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_ms: 10_000,
        }
    }
}

fn default_browser_bridge_timeout_ms() -> u64 {
    10_000
}

/// Out-of-process browser-driver bridge (§1 Non-goals: the Playwright/CDP
/// driver itself ships separately). `endpoint` points at that sidecar's
/// narrow HTTP contract; `None` runs the engine against a no-op session so
/// the rest of the pipeline (queue, profiles, wire interceptor) is still
/// exercisable without a live browser attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserBridgeConfig {
    pub endpoint: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for BrowserBridgeConfig {
    fn default() -> Self {
        Self { endpoint: None, request_timeout_ms: default_browser_bridge_timeout_ms() }
    }
}

fn default_quota_watchdog_interval_s() -> u64 {
    30
}

/// Quota watchdog cadence (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_s: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_quota_watchdog_interval_s(),
        }
    }
}

/// Rotating text-log sink parameters. Log rotation/formatting itself is
/// named out of scope in §1, but the knobs that select its destination are
/// carried as ambient config regardless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub max_backups: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir().join("logs"),
            max_backups: 10,
        }
    }
}

/// One entry in the model-capability table (§4.3), loaded from config rather
/// than hardcoded. `pattern` is matched against the requested model id in
/// declaration order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCapability {
    pub pattern: String,
    #[serde(default)]
    pub thinking: ThinkingCapability,
    #[serde(default = "default_true")]
    pub supports_google_search: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThinkingCapability {
    #[default]
    None,
    Levels {
        levels: Vec<String>,
    },
    Budget {
        min: u32,
        max: u32,
    },
}

fn default_model_capabilities() -> Vec<ModelCapability> {
    vec![
        ModelCapability {
            pattern: "*-pro*".to_string(),
            thinking: ThinkingCapability::Budget {
                min: 128,
                max: 32_768,
            },
            supports_google_search: true,
        },
        ModelCapability {
            pattern: "*-flash*".to_string(),
            thinking: ThinkingCapability::Levels {
                levels: vec!["low".into(), "medium".into(), "high".into()],
            },
            supports_google_search: true,
        },
    ]
}

/// Top-level frozen configuration snapshot (§2 item 2).
///
/// Loaded once at startup into an `Arc<Config>` and atomically swapped on an
/// explicit reload; every subsystem borrows the snapshot it was constructed
/// with rather than reading global mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub function_calling: FunctionCallingConfig,
    pub stream_proxy: StreamProxyConfig,
    pub thinking: ThinkingConfig,
    pub tool_defaults: ToolDefaultsConfig,
    pub cooldowns: CooldownConfig,
    pub profiles: ProfilesConfig,
    pub http: HttpConfig,
    pub mcp: McpConfig,
    pub browser_bridge: BrowserBridgeConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
    #[serde(default = "default_model_capabilities")]
    pub model_capabilities: Vec<ModelCapability>,
    /// Model ids hidden from `GET /v1/models` (§6).
    #[serde(default)]
    pub model_exclusions: Vec<String>,
    /// Model ids reported by `GET /v1/models` in addition to those observed
    /// on the page (§6: "augmented by any injected models").
    #[serde(default)]
    pub injected_models: Vec<String>,
}

impl Config {
    /// Boundary behavior from §8: a zero TTFB timeout is rejected outright
    /// rather than silently clamped.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timing.ttfb_budget_ms() == 0 {
            anyhow::bail!("ttfb timeout must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.function_calling.fuzzy_match_threshold) {
            anyhow::bail!("function_calling.fuzzy_match_threshold must be in [0, 1]");
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_response_timeout_rejects() {
        let mut cfg = Config::default();
        cfg.timing.response_completion_timeout_ms = 0;
        cfg.timing.ttfb_timeout_ms = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn silence_budget_never_below_ttfb() {
        let mut cfg = TimingConfig::default();
        cfg.ttfb_timeout_ms = Some(90_000);
        cfg.response_completion_timeout_ms = 120_000;
        assert!(cfg.silence_budget_ms() >= cfg.ttfb_budget_ms());
    }

    #[test]
    fn silence_budget_hard_cap() {
        let mut cfg = TimingConfig::default();
        cfg.response_completion_timeout_ms = 1_000;
        cfg.silence_timeout_default_ms = 1_000_000;
        assert!(cfg.silence_budget_ms() <= 3 * cfg.response_completion_timeout_ms);
    }

    #[test]
    fn ttfb_derives_from_total_when_absent() {
        let cfg = TimingConfig {
            response_completion_timeout_ms: 90_000,
            ttfb_timeout_ms: None,
            ..Default::default()
        };
        assert_eq!(cfg.ttfb_budget_ms(), 30_000);
    }

    #[test]
    fn clear_between_requests_defaults_false() {
        assert!(!FunctionCallingConfig::default().clear_between_requests);
    }

    #[test]
    fn stream_port_default_nonzero() {
        assert_ne!(StreamProxyConfig::default().stream_port, 0);
    }

    #[test]
    fn yaml_round_trip_full_config() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn yaml_partial_fills_defaults() {
        let yaml = "http:\n  bind: \"0.0.0.0:9000\"\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:9000");
        assert_eq!(cfg.function_calling.mode, FunctionCallingMode::Auto);
    }

    #[test]
    fn function_calling_mode_round_trip() {
        let yaml = "mode: native\n";
        #[derive(Deserialize)]
        struct Wrap {
            mode: FunctionCallingMode,
        }
        let w: Wrap = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(w.mode, FunctionCallingMode::Native);
    }

    #[test]
    fn model_capabilities_default_nonempty() {
        assert!(!Config::default().model_capabilities.is_empty());
    }

    #[test]
    fn fuzzy_threshold_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.function_calling.fuzzy_match_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
