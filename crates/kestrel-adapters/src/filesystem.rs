//! Filesystem tools: read, write, update, delete, create and list.
//!
//! Relative paths resolve against the context's working directory, and no
//! tool touches a path outside it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use kestrel_agent::tools::value::ParamValue;
use kestrel_agent::{AgentContext, ParamType, ParameterSpec, Tool, ToolParams, ToolResult};

use crate::error::{AdapterError, Result, into_tool_result};

/// Maximum characters returned per file read.
const MAX_FILE_READ_CHARS: usize = 16_000;

/// Maximum entries returned by a directory listing.
const MAX_LIST_ENTRIES: usize = 500;

/// Directory names skipped by recursive walks.
pub(crate) const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn require_str<'a>(params: &'a ToolParams, field: &str, tool_name: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(ParamValue::as_str)
        .ok_or_else(|| AdapterError::InvalidParams {
            tool_name: tool_name.to_owned(),
            reason: format!("missing required string field `{field}`"),
        })
}

/// Resolve `raw` against the working directory, refusing paths that escape
/// it.
pub(crate) fn resolve(ctx: &AgentContext, raw: &str) -> Result<PathBuf> {
    let path = ctx.resolve_path(raw);
    if !ctx.is_within_workspace(&path) {
        return Err(AdapterError::OutsideWorkspace {
            path: raw.to_owned(),
        });
    }
    Ok(path)
}

/// Path relative to the working directory, for compact tool output.
pub(crate) fn display_path(ctx: &AgentContext, path: &Path) -> String {
    let root = kestrel_agent::context::normalize_path(&ctx.working_directory);
    path.strip_prefix(&root)
        .unwrap_or(path)
        .display()
        .to_string()
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFile;

impl ReadFile {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = require_str(params, "path", "read_file")?;
        let path = resolve(ctx, raw)?;
        debug!(path = %path.display(), "reading file");

        let text = tokio::fs::read_to_string(&path).await?;
        let start_line = params
            .get("start_line")
            .and_then(ParamValue::as_u64)
            .unwrap_or(1)
            .max(1) as usize;
        let max_lines = params.get("max_lines").and_then(ParamValue::as_u64);

        let total_lines = text.lines().count();
        let selected: String = match max_lines {
            Some(n) => text
                .lines()
                .skip(start_line - 1)
                .take(n as usize)
                .collect::<Vec<_>>()
                .join("\n"),
            None if start_line > 1 => text
                .lines()
                .skip(start_line - 1)
                .collect::<Vec<_>>()
                .join("\n"),
            None => text,
        };

        let (content, truncated) = match selected.char_indices().nth(MAX_FILE_READ_CHARS) {
            Some((end, _)) => (
                format!(
                    "{}\n\n[... truncated at {MAX_FILE_READ_CHARS} chars. Use start_line to read more.]",
                    &selected[..end]
                ),
                true,
            ),
            None => (selected, false),
        };

        Ok(json!({
            "path": display_path(ctx, &path),
            "content": content,
            "total_lines": total_lines,
            "truncated": truncated,
        }))
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the project"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("path", ParamType::String, "File path, relative to the project root"),
            ParameterSpec::optional("start_line", ParamType::Number, "First line to return (1-based)"),
            ParameterSpec::optional("max_lines", ParamType::Number, "Maximum number of lines to return"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFile;

impl WriteFile {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = require_str(params, "path", "write_file")?;
        let content = require_str(params, "content", "write_file")?;
        let path = resolve(ctx, raw)?;
        debug!(path = %path.display(), bytes = content.len(), "writing file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        tokio::fs::write(&path, content).await?;

        Ok(json!({
            "path": display_path(ctx, &path),
            "bytes_written": content.len(),
            "created": !existed,
        }))
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("path", ParamType::String, "File path, relative to the project root"),
            ParameterSpec::required("content", ParamType::String, "Complete new file content"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// update_file
// ---------------------------------------------------------------------------

pub struct UpdateFile;

impl UpdateFile {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = require_str(params, "path", "update_file")?;
        let old_text = require_str(params, "old_text", "update_file")?;
        let new_text = require_str(params, "new_text", "update_file")?;
        let path = resolve(ctx, raw)?;
        debug!(path = %path.display(), "updating file");

        if old_text.is_empty() {
            return Err(AdapterError::InvalidParams {
                tool_name: "update_file".into(),
                reason: "`old_text` must not be empty".into(),
            });
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let match_count = content.matches(old_text).count();

        if match_count == 0 {
            return Err(AdapterError::ExecutionFailed {
                tool_name: "update_file".into(),
                reason: format!("old_text not found in `{raw}`"),
            });
        }
        if match_count > 1 {
            return Err(AdapterError::ExecutionFailed {
                tool_name: "update_file".into(),
                reason: format!(
                    "old_text matches {match_count} times in `{raw}` (must be unique)"
                ),
            });
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&path, &updated).await?;

        Ok(json!({
            "path": display_path(ctx, &path),
            "replaced": 1,
        }))
    }
}

#[async_trait]
impl Tool for UpdateFile {
    fn name(&self) -> &str {
        "update_file"
    }

    fn description(&self) -> &str {
        "Replace one unique occurrence of `old_text` with `new_text` in a file"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("path", ParamType::String, "File path, relative to the project root"),
            ParameterSpec::required("old_text", ParamType::String, "Exact text to replace; must occur once"),
            ParameterSpec::required("new_text", ParamType::String, "Replacement text"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// delete_file
// ---------------------------------------------------------------------------

pub struct DeleteFile;

impl DeleteFile {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = require_str(params, "path", "delete_file")?;
        let path = resolve(ctx, raw)?;
        debug!(path = %path.display(), "deleting file");

        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(AdapterError::ExecutionFailed {
                tool_name: "delete_file".into(),
                reason: format!("`{raw}` is a directory; only files can be deleted"),
            });
        }
        tokio::fs::remove_file(&path).await?;

        Ok(json!({
            "path": display_path(ctx, &path),
            "deleted": true,
        }))
    }
}

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::required(
            "path",
            ParamType::String,
            "File path, relative to the project root",
        )]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// create_directory
// ---------------------------------------------------------------------------

pub struct CreateDirectory;

impl CreateDirectory {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = require_str(params, "path", "create_directory")?;
        let path = resolve(ctx, raw)?;
        debug!(path = %path.display(), "creating directory");
        tokio::fs::create_dir_all(&path).await?;
        Ok(json!({ "path": display_path(ctx, &path), "created": true }))
    }
}

#[async_trait]
impl Tool for CreateDirectory {
    fn name(&self) -> &str {
        "create_directory"
    }

    fn description(&self) -> &str {
        "Create a directory, including missing parents"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![ParameterSpec::required(
            "path",
            ParamType::String,
            "Directory path, relative to the project root",
        )]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

pub struct ListDirectory;

impl ListDirectory {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let raw = params.get("path").and_then(ParamValue::as_str).unwrap_or(".");
        let recursive = params
            .get("recursive")
            .and_then(ParamValue::as_bool)
            .unwrap_or(false);
        let root = resolve(ctx, raw)?;
        debug!(path = %root.display(), recursive, "listing directory");

        let mut entries = Vec::new();
        let mut pending = vec![root.clone()];
        let mut truncated = false;

        'walk: while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            let mut batch = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                batch.push(entry);
            }
            batch.sort_by_key(|e| e.file_name());

            for entry in batch {
                if entries.len() >= MAX_LIST_ENTRIES {
                    truncated = true;
                    break 'walk;
                }
                let file_type = entry.file_type().await?;
                let path = entry.path();
                let name = path
                    .strip_prefix(&root)
                    .unwrap_or(&path)
                    .display()
                    .to_string();

                if file_type.is_dir() {
                    entries.push(json!({ "name": format!("{name}/"), "is_dir": true }));
                    let skip = entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| IGNORED_DIRS.contains(&n));
                    if recursive && !skip {
                        pending.push(path);
                    }
                } else {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    entries.push(json!({ "name": name, "is_dir": false, "size_bytes": size }));
                }
            }
        }

        Ok(json!({
            "path": display_path(ctx, &root),
            "count": entries.len(),
            "entries": entries,
            "truncated": truncated,
        }))
    }
}

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::with_default("path", ParamType::String, ".", "Directory path, relative to the project root"),
            ParameterSpec::with_default("recursive", ParamType::Boolean, false, "Descend into subdirectories"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
