// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Operational endpoints (§6): `GET /health`, `GET /api/info`,
//! `GET /v1/queue`, and `POST /v1/cancel/:req_id`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use super::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = &state.engine;
    Json(json!({
        "playwright_ready": state.browser_bridge_configured,
        "browser_connected": engine.browser_readiness.connected(),
        "page_ready": engine.browser_readiness.page_ready(),
        "worker_running": engine.worker_running(),
        "queue_length": engine.queue.len(),
        "deployment_mode": deployment_mode_str(engine.deployment_mode.get()),
    }))
}

fn deployment_mode_str(mode: relay_core::worker::DeploymentMode) -> &'static str {
    use relay_core::worker::DeploymentMode::*;
    match mode {
        Normal => "normal",
        QuotaExceeded => "quota_exceeded",
        NeedsRotation => "needs_rotation",
        Emergency => "emergency",
    }
}

/// Effective non-secret configuration (§6). `Config` carries only paths to
/// credential/key material, never the material itself, so the whole
/// snapshot is safe to serialize verbatim.
pub async fn api_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut info = serde_json::to_value(state.engine.config.as_ref()).unwrap_or(json!({}));
    info["deployment_mode"] = json!(deployment_mode_str(state.engine.deployment_mode.get()));
    info["browser_bridge_configured"] = json!(state.browser_bridge_configured);
    info["wire_interceptor_healthy"] = json!(state.wire_interceptor_healthy);
    Json(info)
}

pub async fn queue_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "queue_length": state.engine.queue.len() }))
}

/// `POST /v1/cancel/:req_id` (§6): fires the request's cancellation token
/// if it's still registered. Idempotent -- cancelling twice, or cancelling
/// a request that already finished, is not an error.
pub async fn cancel_request(State(state): State<AppState>, Path(req_id): Path<String>) -> impl IntoResponse {
    let found = state
        .cancel_registry
        .lock()
        .unwrap()
        .get(&req_id)
        .map(|token| token.cancel())
        .is_some();
    if found {
        (StatusCode::ACCEPTED, Json(json!({ "cancelled": true, "req_id": req_id })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "cancelled": false, "req_id": req_id })))
    }
}
