// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The public HTTP(S) surface (§6): route table, shared [`AppState`], and
//! the TLS-vs-plain-HTTP `serve` entry point. Each handler module owns one
//! slice of the route table; this module only wires them together.

pub mod admin;
pub mod auth;
pub mod chat;
pub mod models;
pub mod security;
pub mod tls;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use relay_core::cancel::CancellationToken;
use relay_core::Engine;

use crate::proxy::{self, WireInterceptor};
use auth::{ApiKeySet, AsAuthState, AuthState};

/// One shared clone per connection; every field is itself cheap to clone
/// (`Arc`/`Clone` handles), matching the engine's own "explicit state, no
/// globals" design (§9).
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: AuthState,
    /// Live cancellation tokens keyed by request id, for `POST /v1/cancel/:req_id`.
    pub cancel_registry: Arc<Mutex<HashMap<String, CancellationToken>>>,
    pub browser_bridge_configured: bool,
    pub wire_interceptor_healthy: bool,
}

impl AsAuthState for AppState {
    fn auth_state(&self) -> &AuthState {
        &self.auth
    }
}

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Assemble the full route table: the OpenAI-compatible surface, the
/// operational endpoints (§6), and the wire interceptor's internal ingest
/// contract (§4.8) on its own sub-router since it carries a different
/// state type.
pub fn router(state: AppState, interceptor: WireInterceptor) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/health", get(admin::health))
        .route("/api/info", get(admin::api_info))
        .route("/v1/queue", get(admin::queue_status))
        .route("/v1/cancel/:req_id", post(admin::cancel_request))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::api_key_auth_mw))
        .layer(axum::middleware::from_fn(security::security_headers))
        .layer(axum::middleware::from_fn(security::csrf_guard))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state);

    let internal = Router::new()
        .route("/_internal/wire/:correlation", post(proxy::ingest_chunk))
        .route("/_internal/wire/:correlation/close", post(proxy::ingest_close))
        .with_state(interceptor);

    Router::new().merge(api).merge(internal)
}

/// Build [`AuthState`] from `HttpConfig` (§6 Authentication).
pub fn build_auth_state(config: &relay_config::HttpConfig) -> anyhow::Result<AuthState> {
    let keys = match &config.api_keys_file {
        Some(path) if path.exists() => ApiKeySet::load(path)?,
        _ => ApiKeySet::empty(),
    };
    Ok(AuthState::new(keys, config.rate_limit_per_minute, config.rate_limit_burst))
}

/// Bind and serve, dispatching to TLS or plain HTTP per `HttpConfig`
/// (§6). `insecure_dev_mode` is the shipped default — loopback-only plain
/// HTTP for local development, not a production recommendation (§9).
pub async fn serve(config: &relay_config::HttpConfig, app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    if config.insecure_dev_mode && config.tls_cert_file.is_none() {
        info!(%addr, "serving plain HTTP (insecure_dev_mode)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, make_service).await?;
        return Ok(());
    }

    let cert_dir = tls::default_cert_dir();
    let runtime = tls::load_or_generate(config.tls_cert_file.as_deref(), config.tls_key_file.as_deref(), &cert_dir)?;
    info!(%addr, fingerprint = %runtime.fingerprint_sha256, "serving HTTPS");
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&runtime.cert_path, &runtime.key_path).await?;
    axum_server::bind_rustls(addr, rustls_config).serve(make_service).await?;
    Ok(())
}
