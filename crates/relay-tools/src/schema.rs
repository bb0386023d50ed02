// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-Schema → site-native `FunctionDeclaration` conversion (§4.7).

use relay_model::ToolDefinition;
use serde::Serialize;
use serde_json::Value;

use crate::ToolError;

/// Fields the site's function-declaration editor does not understand.
/// Present on a client's JSON Schema for validation purposes that have no
/// counterpart in the page's own (much narrower) schema dialect.
const UNSUPPORTED_FIELDS: &[&str] = &[
    "strict", "minimum", "maximum", "pattern", "minLength", "maxLength", "minItems", "maxItems",
    "$schema", "$id", "$ref",
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Convert one client tool definition into a [`FunctionDeclaration`],
/// stripping fields the page's schema editor cannot represent.
///
/// Rejects with [`ToolError::InvalidTool`] only when the declaration has no
/// name. An empty `parameters` object (`{}`) is valid -- a tool that takes
/// no arguments -- and is normalized to `{"type": "object"}`.
pub fn to_function_declaration(tool: &ToolDefinition) -> Result<FunctionDeclaration, ToolError> {
    if tool.function.name.trim().is_empty() {
        return Err(ToolError::InvalidTool("tool function name is empty".into()));
    }
    let parameters = strip_unsupported(&tool.function.parameters);
    let parameters = if parameters.is_null() || parameters.as_object().is_some_and(|o| o.is_empty()) {
        serde_json::json!({ "type": "object" })
    } else {
        parameters
    };
    Ok(FunctionDeclaration {
        name: tool.function.name.clone(),
        description: tool.function.description.clone(),
        parameters,
    })
}

/// Convert a whole tool list, stopping at the first invalid entry.
pub fn convert_all(tools: &[ToolDefinition]) -> Result<Vec<FunctionDeclaration>, ToolError> {
    tools.iter().map(to_function_declaration).collect()
}

fn strip_unsupported(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let cleaned: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !UNSUPPORTED_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), strip_unsupported(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_unsupported).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON serialization used as the digest cache's hash input:
/// object keys sorted, no whitespace. `serde_json::Value`'s `Map` is a
/// `BTreeMap` by default (the `preserve_order` feature is not enabled on
/// this workspace's `serde_json`), so `to_string` already emits sorted keys.
pub fn canonical_json(decls: &[FunctionDeclaration]) -> String {
    serde_json::to_string(decls).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_model::ToolFunctionSchema;

    fn tool(name: &str, params: Value) -> ToolDefinition {
        ToolDefinition {
            kind: "function".into(),
            function: ToolFunctionSchema { name: name.into(), description: "desc".into(), parameters: params },
        }
    }

    #[test]
    fn strips_unsupported_fields() {
        let params = serde_json::json!({
            "type": "object",
            "properties": { "q": { "type": "string", "minLength": 1, "pattern": "^a" } },
            "$schema": "http://json-schema.org/draft-07/schema#",
        });
        let decl = to_function_declaration(&tool("search", params)).unwrap();
        let props = &decl.parameters["properties"]["q"];
        assert!(props.get("minLength").is_none());
        assert!(props.get("pattern").is_none());
        assert!(decl.parameters.get("$schema").is_none());
        assert_eq!(props["type"], "string");
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = to_function_declaration(&tool("  ", serde_json::json!({"type":"object"})));
        assert!(matches!(err, Err(ToolError::InvalidTool(_))));
    }

    #[test]
    fn nested_arrays_are_stripped_recursively() {
        let params = serde_json::json!({
            "type": "object",
            "properties": {
                "items": { "type": "array", "minItems": 2, "items": { "type": "number", "maximum": 10 } }
            }
        });
        let decl = to_function_declaration(&tool("f", params)).unwrap();
        let items = &decl.parameters["properties"]["items"];
        assert!(items.get("minItems").is_none());
        assert!(items["items"].get("maximum").is_none());
    }

    #[test]
    fn canonical_json_is_deterministic() {
        let a = to_function_declaration(&tool("f", serde_json::json!({"type":"object"}))).unwrap();
        let b = a.clone();
        assert_eq!(canonical_json(&[a]), canonical_json(&[b]));
    }

    #[test]
    fn convert_all_stops_at_first_invalid() {
        let tools = vec![tool("good", serde_json::json!({"type":"object"})), tool("", serde_json::json!({}))];
        assert!(convert_all(&tools).is_err());
    }

    #[test]
    fn empty_parameters_object_is_accepted_and_normalized() {
        let decl = to_function_declaration(&tool("no_args", serde_json::json!({}))).unwrap();
        assert_eq!(decl.parameters, serde_json::json!({"type": "object"}));
    }

    #[test]
    fn missing_parameters_after_stripping_is_accepted_and_normalized() {
        let decl = to_function_declaration(&tool("legacy", serde_json::json!({"$schema": "x", "$id": "y"}))).unwrap();
        assert_eq!(decl.parameters, serde_json::json!({"type": "object"}));
    }
}
