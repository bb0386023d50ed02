// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SHA-256 digest over the canonical JSON of a tool list, used to detect
//! whether the declarations currently installed on the page match the
//! current request's tool list (§3 `FunctionDeclarationsState`).

use sha2::{Digest, Sha256};

use crate::schema::{canonical_json, FunctionDeclaration};

pub fn compute_digest(decls: &[FunctionDeclaration]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(decls).as_bytes());
    hex::encode(hasher.finalize())
}
