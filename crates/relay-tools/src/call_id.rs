// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Call-ID manager (§4.7): generates `call_` + 24 lowercase hex chars and
//! tracks the in-request `id → (name, args)` mapping used to align a later
//! `role=tool` message against the call it answers.

use std::collections::HashMap;

use rand::Rng;

const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Generate a fresh call ID: `call_` followed by 24 random lowercase hex
/// digits, matching the shape validated by [`relay_model::ToolCall::is_valid_id`].
pub fn generate_call_id() -> String {
    let mut rng = rand::thread_rng();
    let hex: String = (0..24).map(|_| HEX_CHARS[rng.gen_range(0..16)] as char).collect();
    format!("call_{hex}")
}

/// Tracks calls issued within a single request so a later tool-result
/// message can be matched back to the `(name, arguments)` it answers.
#[derive(Debug, Default)]
pub struct CallIdManager {
    issued: HashMap<String, (String, String)>,
}

impl CallIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new call ID, retrying on the vanishingly unlikely event of a
    /// collision within this request, and record it.
    pub fn issue(&mut self, name: impl Into<String>, arguments: impl Into<String>) -> String {
        let (name, arguments) = (name.into(), arguments.into());
        loop {
            let id = generate_call_id();
            if !self.issued.contains_key(&id) {
                self.issued.insert(id.clone(), (name, arguments));
                return id;
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&(String, String)> {
        self.issued.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_model::ToolCall;

    #[test]
    fn generated_ids_have_the_required_shape() {
        for _ in 0..50 {
            let id = generate_call_id();
            assert!(ToolCall::is_valid_id(&id), "invalid id: {id}");
        }
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| generate_call_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn manager_tracks_issued_calls() {
        let mut mgr = CallIdManager::new();
        let id = mgr.issue("shell", "{\"cmd\":\"ls\"}");
        let (name, args) = mgr.lookup(&id).unwrap();
        assert_eq!(name, "shell");
        assert_eq!(args, "{\"cmd\":\"ls\"}");
    }

    #[test]
    fn unknown_id_returns_none() {
        let mgr = CallIdManager::new();
        assert!(mgr.lookup("call_nonexistent").is_none());
    }
}
