// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `GET /v1/models` (§6): always open, regardless of configured API keys,
//! so a client can discover what's available before authenticating.
//!
//! The live model picker lives in the page's own DOM and scraping it is out
//! of scope here (§1 Non-goals); this module instead serves a fixed catalog
//! of the model ids AI Studio exposes today, filtered by
//! `model_exclusions` and augmented by `injected_models` exactly as §6
//! describes. An operator who adds a model to the site before this list is
//! updated can still reach it through `injected_models`.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use super::AppState;

/// Baseline catalog, refreshed by hand as the site adds models (§6).
const BASE_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
];

/// Resolve the effective catalog: base minus `model_exclusions`, plus
/// `injected_models` (deduplicated, exclusions still apply to injected
/// entries too since an operator may want to hide one they just added).
pub fn effective_models(config: &relay_config::Config) -> Vec<String> {
    let mut ids: Vec<String> = BASE_MODELS
        .iter()
        .map(|s| s.to_string())
        .chain(config.injected_models.iter().cloned())
        .filter(|id| !config.model_exclusions.contains(id))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let data: Vec<Value> = effective_models(&state.engine.config)
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model", "created": created, "owned_by": "google-aistudio-relay" }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}
