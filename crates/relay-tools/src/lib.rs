// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-related conversions that sit between the OpenAI-compatible wire
//! format and the site's own function-calling surface: JSON-Schema
//! conversion, the declarations digest cache, call-ID minting, and emulated-
//! mode text parsing (§4.7).

pub mod call_id;
pub mod digest;
pub mod parser;
pub mod schema;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid tool: {0}")]
    InvalidTool(String),
}

pub use call_id::{generate_call_id, CallIdManager};
pub use digest::compute_digest;
pub use parser::{parse_emulated_call, ParsedCall};
pub use schema::{canonical_json, convert_all, to_function_declaration, FunctionDeclaration};
