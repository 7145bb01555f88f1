//! Prompt assembly for the agent loop.
//!
//! The model learns about tools only through the system prompt built here,
//! and sees earlier tool executions only through the enriched blocks that
//! [`render_tool_message`] produces from the history.

use serde_json::Value;

use crate::intention::IntentionAnalysis;
use crate::llm::types::{Message, MessageStatus, Role};
use crate::planner::ExecutionPlan;
use crate::tools::value::{ToolSchema, params_to_json};

/// Persona used when the session configures none.
pub const DEFAULT_PERSONA: &str = "You are Kestrel, a careful coding assistant working inside the \
user's project directory. You inspect before you edit, keep changes minimal, and explain what you \
did in plain language.";

/// Tool output longer than this is cut before it is shown to the model.
const MAX_TOOL_OUTPUT_CHARS: usize = 8_000;

const FORMAT_INSTRUCTIONS: &str = r#"## Calling tools
To use a tool, reply with a JSON object and nothing else:
{"tool": "<tool name>", "parameters": {"<name>": <value>}}

To use several tools in order, reply with a JSON array of such objects:
[{"tool": "read_file", "parameters": {"path": "src/main.rs"}}, {"tool": "list_directory", "parameters": {"path": "."}}]

Tool results are returned to you in the next message.
When the task is complete, reply in plain text without any tool JSON. That reply is shown to the user as your final answer."#;

/// Assemble the system prompt for one turn.
pub fn build_system_prompt(
    persona: &str,
    schemas: &[ToolSchema],
    plan: Option<&ExecutionPlan>,
    intention: Option<&IntentionAnalysis>,
) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str(persona.trim());
    out.push_str("\n\n");

    if schemas.is_empty() {
        out.push_str("## Tools\nNo tools are available. Answer directly.\n");
    } else {
        out.push_str("## Tools\n");
        for schema in schemas {
            out.push_str(&render_schema(schema));
        }
        out.push('\n');
        out.push_str(FORMAT_INSTRUCTIONS);
        out.push('\n');
    }

    if let Some(intention) = intention {
        out.push_str(&format!(
            "\n## Request analysis\nIntent: {}\nApproach: {}\n",
            intention.primary_intent, intention.suggested_approach
        ));
    }

    if let Some(plan) = plan {
        out.push_str("\n## Suggested plan (advisory, adapt as needed)\n");
        out.push_str(&plan.render());
    }

    out
}

fn render_schema(schema: &ToolSchema) -> String {
    let mut out = format!("### {}\n{}\n", schema.name, schema.description);
    if schema.parameters.is_empty() {
        out.push_str("Parameters: none\n");
        return out;
    }
    out.push_str("Parameters:\n");
    for p in &schema.parameters {
        out.push_str(&format!(
            "- `{}` ({}, {}): {}",
            p.name,
            p.kind,
            if p.required { "required" } else { "optional" },
            p.description
        ));
        if let Some(default) = &p.default {
            out.push_str(&format!(" [default: {}]", Value::from(default.clone())));
        }
        out.push('\n');
    }
    out
}

/// The messages sent to the backend: the system prompt followed by the
/// history.  Error-marked messages are left out and tool messages are
/// rewritten into enriched blocks.
pub fn outbound_messages(system_prompt: String, history: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(history.len() + 1);
    out.push(Message::system(system_prompt));

    for msg in history {
        if msg.status == MessageStatus::Error {
            continue;
        }
        if msg.role == Role::Tool {
            let mut rewritten = msg.clone();
            rewritten.content = render_tool_message(msg);
            out.push(rewritten);
        } else {
            out.push(msg.clone());
        }
    }

    out
}

/// Render a tool message as the block the model reads.
pub fn render_tool_message(msg: &Message) -> String {
    let (Some(call), Some(result)) = (&msg.tool_call, &msg.tool_result) else {
        return msg.content.clone();
    };

    let mut out = format!("[Tool Result: {}]\n", call.tool_name);
    out.push_str(&format!("Parameters: {}\n", params_to_json(&call.parameters)));

    if result.success {
        out.push_str("Status: SUCCESS\n");
        let body = match &result.data {
            Some(Value::String(s)) => s.clone(),
            Some(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            None => "(no output)".to_owned(),
        };
        out.push_str(&format!("Result:\n{}\n", truncate_chars(&body, MAX_TOOL_OUTPUT_CHARS)));
        out.push_str(
            "Next actions: use this result to continue. Call another tool if more work is \
             needed, otherwise give the final answer in plain text.",
        );
    } else {
        let error = result.error.as_deref().unwrap_or("unknown error");
        out.push_str("Status: FAILED\n");
        out.push_str(&format!("Error: {}\n", truncate_chars(error, MAX_TOOL_OUTPUT_CHARS)));
        out.push_str(next_actions_for_failure(error));
    }

    out
}

fn next_actions_for_failure(error: &str) -> &'static str {
    if error == "rejected" {
        "Next actions: the user declined this operation. Do not retry it. Ask the user how to \
         proceed or choose a different approach."
    } else if error == "timeout" {
        "Next actions: the tool timed out. Try a narrower request or a different approach."
    } else if error.starts_with("unknown tool") {
        "Next actions: this tool does not exist. Use only the tools listed in the system prompt."
    } else {
        "Next actions: check the parameters against the tool description, then retry with \
         corrected parameters or choose a different approach."
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!(
            "{}\n... [truncated, {} more characters]",
            &text[..idx],
            text[idx..].chars().count()
        ),
        None => text.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
