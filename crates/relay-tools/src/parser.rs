// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Emulated-mode function-call parsing (§4.7): the prompt-injected catalog
//! gets the model to emit a `Request function call: <name>` marker followed
//! by a JSON argument object in plain text, which this module extracts with
//! a bracket-balanced scan rather than a naive single regex (arguments can
//! themselves contain braces inside nested objects or string values).

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCall {
    pub name: String,
    /// Raw JSON-object text as it appeared in the response, unparsed.
    pub arguments: String,
    /// Byte range in the source text this call occupied, so the caller can
    /// strip it from the user-visible content.
    pub span: (usize, usize),
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)request\s+function\s+call:\s*([\w.\-]+)").unwrap())
}

/// Find the first `Request function call: <name>` marker and the JSON
/// object that follows it. Returns `None` if no marker is present or no
/// well-formed JSON object follows one.
pub fn parse_emulated_call(text: &str) -> Option<ParsedCall> {
    let caps = marker_re().captures(text)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();
    let (json_start, json_end) = find_balanced_json(text, whole.end())?;
    Some(ParsedCall {
        name,
        arguments: text[json_start..json_end].to_string(),
        span: (whole.start(), json_end),
    })
}

/// Locate a `{...}` object starting at or after `from`, skipping leading
/// whitespace, tracking string/escape state so braces inside string values
/// don't unbalance the scan. Returns the `[start, end)` byte range of the
/// object including both braces.
fn find_balanced_json(text: &str, from: usize) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'{' {
        return None;
    }
    let open = i;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((open, i + 1));
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Prefix-overlap fraction of `a` and `b`, relative to the shorter string —
/// the truncated-tool-name fuzzy-match criterion (§4.7, §9). A truncated
/// emission like `get_weath` against a known `get_weather` scores `9/9 = 1.0`.
fn prefix_overlap(a: &str, b: &str) -> f64 {
    let shorter_len = a.chars().count().min(b.chars().count());
    if shorter_len == 0 {
        return 0.0;
    }
    let common = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
    common as f64 / shorter_len as f64
}

/// Resolve `found_name` against the set of names the request actually
/// declared. Returns the exact match if present, otherwise the best
/// prefix-overlap match clearing `threshold`, otherwise `None`.
pub fn fuzzy_match_name<'a>(found_name: &str, known_names: impl IntoIterator<Item = &'a str>, threshold: f64) -> Option<&'a str> {
    let known: Vec<&str> = known_names.into_iter().collect();
    if let Some(exact) = known.iter().find(|n| **n == found_name) {
        return Some(exact);
    }
    known
        .into_iter()
        .map(|n| (n, prefix_overlap(found_name, n)))
        .filter(|(_, score)| *score >= threshold)
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(n, _)| n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_marker_followed_by_flat_object() {
        let text = "Request function call: get_weather\n{\"city\": \"Oslo\"}";
        let call = parse_emulated_call(text).unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, r#"{"city": "Oslo"}"#);
    }

    #[test]
    fn handles_nested_braces_in_arguments() {
        let text = "Request function call: search\n{\"filter\": {\"tags\": [\"a\", \"b\"]}}";
        let call = parse_emulated_call(text).unwrap();
        assert_eq!(call.arguments, r#"{"filter": {"tags": ["a", "b"]}}"#);
    }

    #[test]
    fn handles_brace_characters_inside_string_values() {
        let text = "Request function call: echo\n{\"text\": \"a { b } c\"}";
        let call = parse_emulated_call(text).unwrap();
        assert_eq!(call.arguments, r#"{"text": "a { b } c"}"#);
    }

    #[test]
    fn no_marker_returns_none() {
        assert!(parse_emulated_call("just some regular text").is_none());
    }

    #[test]
    fn marker_without_following_object_returns_none() {
        assert!(parse_emulated_call("Request function call: foo\nno json here").is_none());
    }

    #[test]
    fn marker_is_case_insensitive_and_allows_dotted_names() {
        let text = "REQUEST FUNCTION CALL: ns.tool-v2\n{}";
        let call = parse_emulated_call(text).unwrap();
        assert_eq!(call.name, "ns.tool-v2");
    }

    #[test]
    fn fuzzy_match_prefers_exact_match() {
        let known = vec!["get_weather", "get_weath"];
        assert_eq!(fuzzy_match_name("get_weath", known, 0.7), Some("get_weath"));
    }

    #[test]
    fn fuzzy_match_resolves_truncated_name_above_threshold() {
        let known = vec!["get_weather"];
        assert_eq!(fuzzy_match_name("get_weath", known, 0.7), Some("get_weather"));
    }

    #[test]
    fn fuzzy_match_rejects_below_threshold() {
        let known = vec!["get_weather"];
        assert_eq!(fuzzy_match_name("xyz", known, 0.7), None);
    }

    #[test]
    fn fuzzy_match_no_candidates_returns_none() {
        let known: Vec<&str> = vec![];
        assert_eq!(fuzzy_match_name("anything", known, 0.7), None);
    }
}
