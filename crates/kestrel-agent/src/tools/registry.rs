//! Tool trait and registry.
//!
//! Tools are registered once at startup and looked up by name when the
//! agent loop executes a directive.  [`ToolRegistry::execute`] never returns
//! an error: unknown names, invalid parameters and timeouts all become failed
//! [`ToolResult`]s that are fed back to the model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::llm::types::ToolResult;
use crate::tools::value::{ParameterSpec, ToolParams, ToolSchema, validate_params};

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A named capability the model can invoke.
///
/// Implementations report expected failures (missing file, non-zero exit)
/// through [`ToolResult::failure`] rather than panicking.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in directives.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// Declared parameters.
    fn parameters(&self) -> Vec<ParameterSpec>;

    /// Run the tool with already-validated parameters.
    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult;

    /// The schema exposed to the model.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.parameters(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-indexed collection of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Registration order, for stable schema listings.
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, replacing earlier registration");
        } else {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas of every registered tool, in registration order.
    pub fn all_tool_schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.schema())
            .collect()
    }

    pub fn tool_schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools.get(name).map(|tool| tool.schema())
    }

    /// Validate and run a tool, bounded by `timeout`.
    ///
    /// On timeout the tool future is dropped, so a late completion can never
    /// be observed by a later call.
    pub async fn execute(
        &self,
        name: &str,
        params: &ToolParams,
        ctx: &AgentContext,
        timeout: Duration,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            let err = AgentError::ToolUnknown {
                tool_name: name.to_owned(),
            };
            tracing::warn!(tool = %name, "directive references unknown tool");
            return ToolResult::failure(err.to_string());
        };

        let params = match validate_params(&tool.parameters(), params) {
            Ok(p) => p,
            Err(reason) => {
                let err = AgentError::ToolExecution {
                    tool_name: name.to_owned(),
                    reason,
                };
                tracing::debug!(tool = %name, error = %err, "parameter validation failed");
                return ToolResult::failure(err.to_string());
            }
        };

        let started = Instant::now();
        tracing::debug!(tool = %name, "executing tool");

        match tokio::time::timeout(timeout, tool.execute(&params, ctx)).await {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if !result.success {
                    tracing::warn!(
                        tool = %name,
                        error = result.error.as_deref().unwrap_or(""),
                        "tool reported failure"
                    );
                }
                result.with_metadata("duration_ms", json!(elapsed_ms))
            }
            Err(_) => {
                let err = AgentError::ToolTimeout {
                    tool_name: name.to_owned(),
                    seconds: timeout.as_secs(),
                };
                tracing::warn!(tool = %name, error = %err, "tool timed out");
                ToolResult::failure("timeout").with_metadata("timeout_ms", json!(timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::value::{ParamType, ParamValue, params_from_json};

    struct Echo {
        label: &'static str,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            self.label
        }

        fn parameters(&self) -> Vec<ParameterSpec> {
            vec![
                ParameterSpec::required("text", ParamType::String, "text to echo"),
                ParameterSpec::with_default("times", ParamType::Number, 1.0, "repetitions"),
            ]
        }

        async fn execute(&self, params: &ToolParams, _ctx: &AgentContext) -> ToolResult {
            let text = params.get("text").and_then(ParamValue::as_str).unwrap_or("");
            let times = params.get("times").and_then(ParamValue::as_u64).unwrap_or(1);
            ToolResult::ok(json!(text.repeat(times as usize)))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }

        async fn execute(&self, _params: &ToolParams, _ctx: &AgentContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(10)).await;
            ToolResult::ok(json!("late"))
        }
    }

    fn ctx() -> AgentContext {
        AgentContext::new(".")
    }

    #[tokio::test]
    async fn executes_with_defaults() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { label: "first" }));
        let params = params_from_json(json!({"text": "ab"}));
        let result = registry
            .execute("echo", &params, &ctx(), Duration::from_secs(1))
            .await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!("ab")));
        assert!(result.metadata.unwrap().contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn unknown_tool_is_failed_result() {
        let registry = ToolRegistry::new();
        let result = registry
            .execute("nope", &ToolParams::new(), &ctx(), Duration::from_secs(1))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown tool: nope"));
    }

    #[tokio::test]
    async fn invalid_params_are_failed_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { label: "e" }));
        let result = registry
            .execute("echo", &ToolParams::new(), &ctx(), Duration::from_secs(1))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing required parameter `text`"));
    }

    #[tokio::test]
    async fn timeout_yields_timeout_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Sleepy));
        let result = registry
            .execute("sleepy", &ToolParams::new(), &ctx(), Duration::from_millis(20))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { label: "first" }));
        registry.register(Arc::new(Echo { label: "second" }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["echo".to_owned()]);
        assert_eq!(registry.tool_schema("echo").unwrap().description, "second");
    }

    #[test]
    fn schemas_follow_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Sleepy));
        registry.register(Arc::new(Echo { label: "e" }));
        let names: Vec<_> = registry
            .all_tool_schemas()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["sleepy", "echo"]);
    }
}
