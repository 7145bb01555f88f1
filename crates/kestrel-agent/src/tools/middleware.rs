//! Tool execution middleware.
//!
//! The agent loop executes directives through a [`ToolExecutor`].  The base
//! executor dispatches to the [`ToolRegistry`]; hosts wrap it with layers
//! that observe or intercept calls without touching the loop itself:
//!
//! ```text
//! ApprovalGate ──> SnapshotRecorder ──> RegistryExecutor ──> Tool
//! ```
//!
//! [`ExecutorChain`] composes the layers in that order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::context::AgentContext;
use crate::llm::types::{ToolCall, ToolResult};
use crate::snapshot::SnapshotHandle;
use crate::tools::registry::ToolRegistry;
use crate::tools::value::{ParamValue, ToolParams, params_to_json};

/// Tools that require confirmation unless configured otherwise.
pub const DEFAULT_SENSITIVE_TOOLS: &[&str] = &[
    "write_file",
    "update_file",
    "delete_file",
    "run_command",
    "create_directory",
];

/// Tools whose `path` target is captured before they run.
pub const SNAPSHOT_TOOLS: &[&str] = &["write_file", "update_file", "delete_file"];

/// Characters of file content shown in an approval preview.
const PREVIEW_CHARS: usize = 400;

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Executes one directive.  Never fails: problems become failed results.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &AgentContext, timeout: Duration) -> ToolResult;
}

/// The innermost executor: validates and runs the registered tool.
pub struct RegistryExecutor {
    registry: Arc<ToolRegistry>,
}

impl RegistryExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for RegistryExecutor {
    async fn execute(&self, call: &ToolCall, ctx: &AgentContext, timeout: Duration) -> ToolResult {
        self.registry
            .execute(&call.tool_name, &call.parameters, ctx, timeout)
            .await
    }
}

// ---------------------------------------------------------------------------
// Snapshot layer
// ---------------------------------------------------------------------------

/// Captures the pre-state of files targeted by mutating tools.
pub struct SnapshotRecorder {
    inner: Arc<dyn ToolExecutor>,
    store: SnapshotHandle,
    tracked: HashSet<String>,
}

impl SnapshotRecorder {
    pub fn new(inner: Arc<dyn ToolExecutor>, store: SnapshotHandle) -> Self {
        Self {
            inner,
            store,
            tracked: SNAPSHOT_TOOLS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

#[async_trait]
impl ToolExecutor for SnapshotRecorder {
    async fn execute(&self, call: &ToolCall, ctx: &AgentContext, timeout: Duration) -> ToolResult {
        if self.tracked.contains(&call.tool_name) {
            if let Some(raw) = call.parameters.get("path").and_then(ParamValue::as_str) {
                let path = ctx.resolve_path(raw);
                let captured = self.store.lock().await.capture(&path).await;
                tracing::debug!(tool = %call.tool_name, path = %path.display(), captured, "snapshot capture");
            }
        }
        self.inner.execute(call, ctx, timeout).await
    }
}

// ---------------------------------------------------------------------------
// Approval layer
// ---------------------------------------------------------------------------

/// What the host is asked to confirm.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub parameters: ToolParams,
    /// Human-readable summary of the effect.
    pub preview: String,
}

/// Host seam for confirming sensitive tool calls.
///
/// `confirm` may take arbitrarily long; the agent loop waits without a
/// timeout.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    fn needs_approval(&self, tool_name: &str) -> bool;

    async fn confirm(&self, request: &ApprovalRequest) -> bool;
}

/// The set of tools considered sensitive.
#[derive(Debug, Clone)]
pub struct SensitiveToolPolicy {
    tools: HashSet<String>,
}

impl Default for SensitiveToolPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_TOOLS.iter().copied())
    }
}

impl SensitiveToolPolicy {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_sensitive(&self, tool_name: &str) -> bool {
        self.tools.contains(tool_name)
    }
}

/// Approves everything without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    fn needs_approval(&self, _tool_name: &str) -> bool {
        false
    }

    async fn confirm(&self, _request: &ApprovalRequest) -> bool {
        true
    }
}

/// Rejects every sensitive call.
#[derive(Debug, Clone, Default)]
pub struct AutoReject {
    pub policy: SensitiveToolPolicy,
}

#[async_trait]
impl ApprovalHandler for AutoReject {
    fn needs_approval(&self, tool_name: &str) -> bool {
        self.policy.is_sensitive(tool_name)
    }

    async fn confirm(&self, request: &ApprovalRequest) -> bool {
        tracing::info!(tool = %request.tool_name, "auto-rejecting sensitive tool");
        false
    }
}

/// Asks the [`ApprovalHandler`] before running sensitive tools.
pub struct ApprovalGate {
    inner: Arc<dyn ToolExecutor>,
    handler: Arc<dyn ApprovalHandler>,
}

impl ApprovalGate {
    pub fn new(inner: Arc<dyn ToolExecutor>, handler: Arc<dyn ApprovalHandler>) -> Self {
        Self { inner, handler }
    }
}

#[async_trait]
impl ToolExecutor for ApprovalGate {
    async fn execute(&self, call: &ToolCall, ctx: &AgentContext, timeout: Duration) -> ToolResult {
        if self.handler.needs_approval(&call.tool_name) {
            let request = ApprovalRequest {
                tool_name: call.tool_name.clone(),
                parameters: call.parameters.clone(),
                preview: approval_preview(call),
            };
            if !self.handler.confirm(&request).await {
                tracing::info!(tool = %call.tool_name, call_id = %call.id, "tool call rejected");
                return ToolResult::failure("rejected")
                    .with_metadata("rejected_by", json!("user"));
            }
            tracing::debug!(tool = %call.tool_name, call_id = %call.id, "tool call approved");
        }
        self.inner.execute(call, ctx, timeout).await
    }
}

/// Render a short description of what a call will do.
pub fn approval_preview(call: &ToolCall) -> String {
    let param = |name: &str| call.parameters.get(name).and_then(ParamValue::as_str);
    let clip = |text: &str| -> String {
        let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            out.push_str("\n...");
        }
        out
    };

    match (call.tool_name.as_str(), param("path")) {
        ("write_file", Some(path)) => {
            format!("Write {path}:\n{}", clip(param("content").unwrap_or("")))
        }
        ("update_file", Some(path)) => format!(
            "Edit {path}:\n- {}\n+ {}",
            clip(param("old_text").unwrap_or("")),
            clip(param("new_text").unwrap_or(""))
        ),
        ("delete_file", Some(path)) => format!("Delete {path}"),
        ("create_directory", Some(path)) => format!("Create directory {path}"),
        _ => match param("command") {
            Some(command) if call.tool_name == "run_command" => format!("Run: {command}"),
            _ => format!(
                "{} {}",
                call.tool_name,
                params_to_json(&call.parameters)
            ),
        },
    }
}

// ---------------------------------------------------------------------------
// Chain builder
// ---------------------------------------------------------------------------

/// Composes executor layers around the registry.
///
/// Each `with_*` call wraps the chain built so far, so the last layer added
/// runs first.
pub struct ExecutorChain {
    current: Arc<dyn ToolExecutor>,
}

impl ExecutorChain {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            current: Arc::new(RegistryExecutor::new(registry)),
        }
    }

    pub fn with_snapshots(self, store: SnapshotHandle) -> Self {
        Self {
            current: Arc::new(SnapshotRecorder::new(self.current, store)),
        }
    }

    pub fn with_approval(self, handler: Arc<dyn ApprovalHandler>) -> Self {
        Self {
            current: Arc::new(ApprovalGate::new(self.current, handler)),
        }
    }

    /// Wrap with an arbitrary layer.
    pub fn layer<F>(self, wrap: F) -> Self
    where
        F: FnOnce(Arc<dyn ToolExecutor>) -> Arc<dyn ToolExecutor>,
    {
        Self {
            current: wrap(self.current),
        }
    }

    pub fn build(self) -> Arc<dyn ToolExecutor> {
        self.current
    }
}
