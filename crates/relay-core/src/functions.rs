// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Function-calling orchestration (§4.7): resolves `auto` mode to a concrete
//! strategy, decides whether the declarations digest cache lets the worker
//! skip a UI mutation, builds the emulated-mode prompt catalog, and parses
//! emulated-mode completions back into [`ToolCall`]s.

use std::time::Duration;

use relay_config::{FunctionCallingConfig, FunctionCallingMode};
use relay_model::{FunctionDeclarationsState, ToolCall, ToolDefinition};
use relay_tools::{CallIdManager, FunctionDeclaration};

use crate::error::EngineError;

/// The concrete strategy in force for one request, after `auto` resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Native,
    Emulated,
}

/// Resolve `auto` against whether the model has previously needed a
/// downgrade (tracked by the caller across requests, §4.7): `auto` prefers
/// native and falls back to emulated only once `native_retry_count`
/// consecutive native attempts have failed for this model.
pub fn resolve_mode(configured: FunctionCallingMode, recent_native_failures: u32, native_retry_count: u32) -> ResolvedMode {
    match configured {
        FunctionCallingMode::Native => ResolvedMode::Native,
        FunctionCallingMode::Emulated => ResolvedMode::Emulated,
        FunctionCallingMode::Auto => {
            if recent_native_failures >= native_retry_count {
                ResolvedMode::Emulated
            } else {
                ResolvedMode::Native
            }
        }
    }
}

pub struct PreparedDeclarations {
    pub declarations: Vec<FunctionDeclaration>,
    pub digest: String,
}

/// Convert the client's tool list and compute its cache digest (§3, §4.7).
pub fn prepare(tools: &[ToolDefinition]) -> Result<PreparedDeclarations, relay_tools::ToolError> {
    let declarations = relay_tools::convert_all(tools)?;
    let digest = relay_tools::compute_digest(&declarations);
    Ok(PreparedDeclarations { declarations, digest })
}

/// Whether the worker must mutate the page's declarations editor before
/// this request, or can rely on what's already installed (§3 digest cache).
pub fn needs_install(cached: Option<&FunctionDeclarationsState>, digest: &str, cfg: &FunctionCallingConfig) -> bool {
    if !cfg.cache_enabled {
        return true;
    }
    match cached {
        None => true,
        Some(state) => {
            let ttl = Duration::from_secs(cfg.cache_ttl_s);
            !state.matches(digest) || state.is_expired(ttl)
        }
    }
}

/// Native mode and the page's built-in Google Search / URL Context tools
/// are mutually exclusive (§4.7): installing declarations requires both
/// disabled first.
pub fn native_requires_disabling_builtin_tools(mode: ResolvedMode, declarations_nonempty: bool) -> bool {
    mode == ResolvedMode::Native && declarations_nonempty
}

/// Render the emulated-mode prompt-injected catalog: one block per tool
/// naming it, its description, its parameter schema, and the exact marker
/// format the model must reply with to invoke it (§4.7).
pub fn build_emulated_catalog(declarations: &[FunctionDeclaration]) -> String {
    let mut out = String::from(
        "You have access to the following functions. To call one, respond with exactly:\n\
         Request function call: <name>\n\
         <JSON arguments object>\n\n",
    );
    for decl in declarations {
        out.push_str(&format!(
            "- {name}: {description}\n  parameters: {params}\n",
            name = decl.name,
            description = decl.description,
            params = decl.parameters,
        ));
    }
    out
}

/// Parse one emulated-mode completion into a resolved [`ToolCall`], minting
/// a fresh call ID and resolving a truncated/misspelled name via the
/// fuzzy-match fallback (§4.7, §9).
pub fn parse_emulated_response(
    text: &str,
    known: &[FunctionDeclaration],
    fuzzy_threshold: f64,
    call_ids: &mut CallIdManager,
) -> Result<Option<ToolCall>, EngineError> {
    let Some(parsed) = relay_tools::parser::parse_emulated_call(text) else {
        return Ok(None);
    };
    let known_names: Vec<&str> = known.iter().map(|d| d.name.as_str()).collect();
    let resolved_name = relay_tools::parser::fuzzy_match_name(&parsed.name, known_names, fuzzy_threshold)
        .ok_or_else(|| EngineError::InvalidTool(parsed.name.clone()))?;
    if serde_json::from_str::<serde_json::Value>(&parsed.arguments).is_err() {
        return Err(EngineError::InvalidTool(format!("malformed arguments for {resolved_name}")));
    }
    let id = call_ids.issue(resolved_name, parsed.arguments.clone());
    Ok(Some(ToolCall { id, name: resolved_name.to_string(), arguments: parsed.arguments }))
}
