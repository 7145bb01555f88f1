//! Task planner.
//!
//! Turns a request plus its [`IntentionAnalysis`] into an advisory
//! [`ExecutionPlan`]: an ordered list of steps, each optionally naming the
//! tool it expects to use.  Plans are folded into the system prompt as
//! context and never enforced by the agent loop.
//!
//! When the backend fails or returns something that is not a plan, a
//! deterministic plan is synthesised from the intention's required tools.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::intention::IntentionAnalysis;
use crate::llm::client::ChatBackend;
use crate::llm::retry::RetryPolicy;
use crate::llm::types::{Message, Usage};
use crate::tools::value::{ToolSchema, params_from_json, params_to_json};
use crate::tools::ToolParams;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// An advisory plan for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goal: String,
    pub steps: Vec<TaskStep>,
}

/// A single step within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// One-based position in the plan.
    pub step_number: u32,

    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ToolParams>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,

    /// Step numbers this step builds on.
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// A planning result together with what it cost.
#[derive(Debug, Clone)]
pub struct PlanningOutcome<T> {
    pub value: T,
    pub usage: Option<Usage>,
    /// True when the deterministic fallback produced `value`.
    pub used_fallback: bool,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Creates execution plans with one backend call and a deterministic
/// fallback.
pub struct TaskPlanner {
    backend: Arc<dyn ChatBackend>,
    retry: RetryPolicy,
}

impl TaskPlanner {
    pub fn new(backend: Arc<dyn ChatBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Produce a plan for `request`.
    ///
    /// Only cancellation is surfaced as an error; every other failure falls
    /// back to [`fallback_plan`].
    pub async fn create_plan(
        &self,
        request: &str,
        intention: &IntentionAnalysis,
        tool_schemas: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<PlanningOutcome<ExecutionPlan>> {
        let messages = vec![
            Message::system(build_system_prompt(tool_schemas)),
            Message::user(build_user_prompt(request, intention)),
        ];

        let reply = self
            .retry
            .execute_with_retry("planner", cancel, || self.backend.send_message(&messages))
            .await;

        let (parsed, usage) = match reply {
            Ok(reply) => (parse_plan(&reply.content), reply.usage),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => (Err(e), None),
        };

        match parsed {
            Ok(plan) => {
                tracing::debug!(steps = plan.steps.len(), "plan created");
                Ok(PlanningOutcome {
                    value: plan,
                    usage,
                    used_fallback: false,
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "planning failed, using fallback plan");
                Ok(PlanningOutcome {
                    value: fallback_plan(request, intention),
                    usage,
                    used_fallback: true,
                })
            }
        }
    }
}

/// Build the system prompt for the planning call.
fn build_system_prompt(tool_schemas: &[ToolSchema]) -> String {
    let tool_list: String = tool_schemas
        .iter()
        .map(|t| format!("- `{}`: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a task planner for a coding assistant. Decompose the user's request into a short ordered list of concrete steps.

## Available Tools
{tool_list}

## Output Format
Respond with valid JSON only, in this exact structure:
{{
  "goal": "One sentence describing the outcome",
  "steps": [
    {{
      "step_number": 1,
      "description": "What this step does",
      "tool_name": "name_of_tool or null",
      "parameters": {{}},
      "expected_output": "What success looks like",
      "depends_on": []
    }}
  ]
}}

## Rules
- Use only the tools listed above.
- Keep the plan minimal.
- If the request can be answered directly, use a single step with no tool."#
    )
}

fn build_user_prompt(request: &str, intention: &IntentionAnalysis) -> String {
    format!(
        "Request:\n{request}\n\nIntent: {}\nSuggested approach: {}\nLikely tools: {}",
        intention.primary_intent,
        intention.suggested_approach,
        intention.required_tools.join(", ")
    )
}

/// Parse the backend's JSON reply into an [`ExecutionPlan`].
pub fn parse_plan(text: &str) -> Result<ExecutionPlan> {
    let json_str = extract_json_block(text);

    let v: Value = serde_json::from_str(json_str).map_err(|e| AgentError::PlanningParseFailure {
        reason: format!("failed to parse plan JSON: {e}"),
    })?;

    let steps_value = v["steps"]
        .as_array()
        .ok_or_else(|| AgentError::PlanningParseFailure {
            reason: "plan JSON missing `steps` array".into(),
        })?;

    let steps: Vec<TaskStep> = steps_value
        .iter()
        .enumerate()
        .map(|(i, sv)| TaskStep {
            step_number: sv["step_number"].as_u64().unwrap_or(i as u64 + 1) as u32,
            description: sv["description"]
                .as_str()
                .unwrap_or("Unnamed step")
                .to_owned(),
            tool_name: sv["tool_name"]
                .as_str()
                .filter(|s| !s.is_empty() && *s != "null")
                .map(str::to_owned),
            parameters: sv["parameters"]
                .is_object()
                .then(|| params_from_json(sv["parameters"].clone()))
                .filter(|p| !p.is_empty()),
            expected_output: sv["expected_output"].as_str().map(str::to_owned),
            depends_on: sv["depends_on"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_u64().map(|n| n as u32))
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect();

    if steps.is_empty() {
        return Err(AgentError::PlanningParseFailure {
            reason: "plan contains zero steps".into(),
        });
    }

    Ok(ExecutionPlan {
        goal: v["goal"].as_str().unwrap_or("Complete the request").to_owned(),
        steps,
    })
}

/// Deterministic plan: one step per required tool, each step depending on
/// the one two positions earlier once two prior steps exist.
pub fn fallback_plan(request: &str, intention: &IntentionAnalysis) -> ExecutionPlan {
    let goal = if intention.primary_intent.is_empty() {
        request.chars().take(120).collect()
    } else {
        intention.primary_intent.clone()
    };

    if intention.required_tools.is_empty() {
        return ExecutionPlan {
            goal,
            steps: vec![TaskStep {
                step_number: 1,
                description: "Answer the request directly".into(),
                tool_name: None,
                parameters: None,
                expected_output: Some("A complete answer".into()),
                depends_on: Vec::new(),
            }],
        };
    }

    let steps = intention
        .required_tools
        .iter()
        .enumerate()
        .map(|(i, tool)| {
            let step_number = i as u32 + 1;
            TaskStep {
                step_number,
                description: format!("Use `{tool}` to make progress on the request"),
                tool_name: Some(tool.clone()),
                parameters: None,
                expected_output: None,
                depends_on: if step_number > 2 {
                    vec![step_number - 2]
                } else {
                    Vec::new()
                },
            }
        })
        .collect();

    ExecutionPlan { goal, steps }
}

impl ExecutionPlan {
    /// Render for inclusion in a system prompt.
    pub fn render(&self) -> String {
        let mut out = format!("Goal: {}\n", self.goal);
        for step in &self.steps {
            out.push_str(&format!("{}. {}", step.step_number, step.description));
            if let Some(tool) = &step.tool_name {
                out.push_str(&format!(" (tool: {tool}"));
                if let Some(params) = &step.parameters {
                    out.push_str(&format!(", parameters: {}", params_to_json(params)));
                }
                out.push(')');
            }
            if !step.depends_on.is_empty() {
                let deps: Vec<String> = step.depends_on.iter().map(u32::to_string).collect();
                out.push_str(&format!(" [after step {}]", deps.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

/// Strip Markdown code fences around a JSON reply.
pub(crate) fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    // Bare JSON surrounded by prose.
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
