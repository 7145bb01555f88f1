//! Recovery of tool directives from free-form model text.
//!
//! Models are asked to answer either with plain text (a final answer) or
//! with JSON directives of the form
//! `{"tool": "<name>", "parameters": {...}}`, optionally several of them in a
//! JSON array.  Replies routinely wrap directives in prose or code fences, so
//! extraction scans the text instead of parsing it whole:
//!
//! 1. **Array form.**  The span from the first `[` to the last `]` is tried
//!    when it contains `"tool"`.  If it parses as an array, every element
//!    carrying both `tool` and `parameters` becomes a call and scanning stops.
//! 2. **Object form.**  Otherwise every balanced `{...}` span containing
//!    `"tool"` is parsed on its own.  Failures are skipped; a successful
//!    span is consumed whole so nested objects are not counted twice.
//!
//! Extraction never fails; malformed JSON simply is not a directive.

use serde_json::Value;

use crate::llm::types::ToolCall;
use crate::tools::value::params_from_json;

const TOOL_TOKEN: &str = "\"tool\"";

/// Extract every tool directive from `text`, in source order.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    if !text.contains(TOOL_TOKEN) {
        return Vec::new();
    }

    if let Some(calls) = extract_array_form(text) {
        tracing::debug!(calls = calls.len(), "extracted tool calls (array form)");
        return calls;
    }

    let calls = extract_object_form(text);
    if !calls.is_empty() {
        tracing::debug!(calls = calls.len(), "extracted tool calls (object form)");
    }
    calls
}

/// Whether `text` contains at least one directive.
pub fn contains_tool_call(text: &str) -> bool {
    !extract_tool_calls(text).is_empty()
}

// ---------------------------------------------------------------------------
// Array form
// ---------------------------------------------------------------------------

/// `Some` when the first-`[`-to-last-`]` span parses as an array, even if
/// none of its elements is a directive.
fn extract_array_form(text: &str) -> Option<Vec<ToolCall>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }

    let span = &text[start..=end];
    if !span.contains(TOOL_TOKEN) {
        return None;
    }

    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(span) else {
        return None;
    };

    Some(
        items
            .into_iter()
            .filter_map(|item| directive_from_value(item, true))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Object form
// ---------------------------------------------------------------------------

fn extract_object_form(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find('{') {
        let start = cursor + offset;
        let Some(len) = balanced_object_len(&text[start..]) else {
            // Unbalanced opener (prose, code fragments): skip just this brace.
            cursor = start + 1;
            continue;
        };
        let span = &text[start..start + len];

        if span.contains(TOOL_TOKEN) {
            if let Some(call) = serde_json::from_str::<Value>(span)
                .ok()
                .and_then(|v| directive_from_value(v, false))
            {
                calls.push(call);
                cursor = start + len;
                continue;
            }
        }

        cursor = start + 1;
    }

    calls
}

/// Byte length of the balanced `{...}` object starting at `text[0]`,
/// ignoring braces inside string literals.
fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if ch == '\\' {
                escape_next = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Directive validation
// ---------------------------------------------------------------------------

/// Turn a parsed value into a call.  Array elements must carry both keys;
/// standalone objects may omit `parameters`.
fn directive_from_value(value: Value, require_parameters: bool) -> Option<ToolCall> {
    let Value::Object(mut map) = value else {
        return None;
    };

    let name = match map.remove("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_owned(),
        _ => return None,
    };

    let parameters = match map.remove("parameters") {
        Some(v @ Value::Object(_)) => params_from_json(v),
        Some(Value::Null) | None if !require_parameters => Default::default(),
        _ => return None,
    };

    Some(ToolCall::new(name, parameters))
}
