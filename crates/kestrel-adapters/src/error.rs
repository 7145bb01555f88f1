//! Adapter error types.
//!
//! Tools never surface [`AdapterError`] to the agent loop directly: every
//! failure is folded into a failed [`ToolResult`] by [`into_tool_result`].

use serde_json::Value;

use kestrel_agent::ToolResult;

/// Unified error type for the built-in tools.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The parameters supplied to a tool are invalid.
    #[error("invalid parameters for tool `{tool_name}`: {reason}")]
    InvalidParams { tool_name: String, reason: String },

    /// A path resolved outside the working directory.
    #[error("path `{path}` is outside the working directory")]
    OutsideWorkspace { path: String },

    /// The tool ran but could not do what was asked.
    #[error("{tool_name} failed: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    /// A spawned command exceeded its time limit.
    #[error("timeout after {seconds}s: {reason}")]
    Timeout { seconds: u64, reason: String },

    /// A search pattern did not compile.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Convenience alias for adapter results.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Map a tool body's outcome onto the tool contract.
pub fn into_tool_result(tool_name: &str, outcome: Result<Value>) -> ToolResult {
    match outcome {
        Ok(data) => ToolResult::ok(data),
        Err(e) => {
            tracing::debug!(tool = tool_name, error = %e, "tool reported failure");
            ToolResult::failure(e.to_string())
        }
    }
}
