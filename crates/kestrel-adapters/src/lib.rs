//! Built-in tools for Kestrel: filesystem, search and shell.
//!
//! Each tool implements [`kestrel_agent::Tool`].  Failures never escape as
//! errors; they come back as failed [`kestrel_agent::ToolResult`]s so the
//! model can read them and adjust.

use std::sync::Arc;

use kestrel_agent::{Tool, ToolRegistry};

pub mod error;
pub mod filesystem;
pub mod search;
pub mod shell;

pub use error::{AdapterError, Result};
pub use filesystem::{CreateDirectory, DeleteFile, ListDirectory, ReadFile, UpdateFile, WriteFile};
pub use search::SearchFiles;
pub use shell::RunCommand;

/// Every built-in tool, in the order they are presented to the model.
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFile),
        Arc::new(WriteFile),
        Arc::new(UpdateFile),
        Arc::new(DeleteFile),
        Arc::new(CreateDirectory),
        Arc::new(ListDirectory),
        Arc::new(SearchFiles),
        Arc::new(RunCommand),
    ]
}

/// Register every built-in tool with `registry`.
pub fn register_builtin_tools(registry: &mut ToolRegistry) {
    for tool in builtin_tools() {
        registry.register(tool);
    }
    tracing::debug!(count = registry.len(), "registered built-in tools");
}
