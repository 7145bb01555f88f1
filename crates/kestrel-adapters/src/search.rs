//! `search_files`: regex search over the project tree.

use std::path::PathBuf;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{Value, json};
use tracing::debug;

use kestrel_agent::tools::value::ParamValue;
use kestrel_agent::{AgentContext, ParamType, ParameterSpec, Tool, ToolParams, ToolResult};

use crate::error::{Result, into_tool_result};
use crate::filesystem::{IGNORED_DIRS, display_path, require_str, resolve};

/// Files larger than this are not searched.
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

/// Matched lines are cut to this many characters.
const MAX_LINE_CHARS: usize = 200;

pub struct SearchFiles;

impl SearchFiles {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<Value> {
        let pattern = require_str(params, "pattern", "search_files")?;
        let raw_root = params.get("path").and_then(ParamValue::as_str).unwrap_or(".");
        let max_results = params
            .get("max_results")
            .and_then(ParamValue::as_u64)
            .unwrap_or(50)
            .max(1) as usize;
        let extension = params
            .get("extension")
            .and_then(ParamValue::as_str)
            .map(|e| e.trim_start_matches('.').to_owned())
            .filter(|e| !e.is_empty());
        let case_insensitive = params
            .get("case_insensitive")
            .and_then(ParamValue::as_bool)
            .unwrap_or(false);

        let re = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()?;
        let root = resolve(ctx, raw_root)?;
        debug!(pattern, root = %root.display(), "searching files");

        let mut matches = Vec::new();
        let mut files_scanned = 0usize;
        let mut truncated = false;
        let mut pending: Vec<PathBuf> = Vec::new();

        if tokio::fs::metadata(&root).await?.is_file() {
            files_scanned = 1;
            truncated = scan_file(&root, &re, ctx, max_results, &mut matches).await;
        } else {
            pending.push(root);
        }

        'walk: while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;

            let mut batch = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                batch.push(entry);
            }
            batch.sort_by_key(|e| std::cmp::Reverse(e.file_name()));

            for entry in batch {
                let file_type = entry.file_type().await?;
                let name = entry.file_name();
                let name = name.to_string_lossy();

                if file_type.is_dir() {
                    if !name.starts_with('.') && !IGNORED_DIRS.contains(&name.as_ref()) {
                        pending.push(entry.path());
                    }
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let path = entry.path();
                if let Some(ext) = &extension {
                    if path.extension().and_then(|e| e.to_str()) != Some(ext.as_str()) {
                        continue;
                    }
                }
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(u64::MAX);
                if size > MAX_SEARCH_FILE_BYTES {
                    continue;
                }

                files_scanned += 1;
                if scan_file(&path, &re, ctx, max_results, &mut matches).await {
                    truncated = true;
                    break 'walk;
                }
            }
        }

        Ok(json!({
            "pattern": pattern,
            "files_scanned": files_scanned,
            "count": matches.len(),
            "matches": matches,
            "truncated": truncated,
        }))
    }
}

/// Append matches from one file.  Returns true once `max_results` is hit.
/// Unreadable and non-UTF-8 files are skipped.
async fn scan_file(
    path: &std::path::Path,
    re: &regex::Regex,
    ctx: &AgentContext,
    max_results: usize,
    matches: &mut Vec<Value>,
) -> bool {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return false;
    };
    for (idx, line) in text.lines().enumerate() {
        if re.is_match(line) {
            let shown: String = line.trim().chars().take(MAX_LINE_CHARS).collect();
            matches.push(json!({
                "path": display_path(ctx, path),
                "line": idx + 1,
                "text": shown,
            }));
            if matches.len() >= max_results {
                return true;
            }
        }
    }
    false
}

#[async_trait]
impl Tool for SearchFiles {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search file contents in the project with a regular expression"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("pattern", ParamType::String, "Regular expression to search for"),
            ParameterSpec::with_default("path", ParamType::String, ".", "File or directory to search"),
            ParameterSpec::optional("extension", ParamType::String, "Only search files with this extension, e.g. `rs`"),
            ParameterSpec::with_default("max_results", ParamType::Number, 50.0, "Maximum number of matches"),
            ParameterSpec::with_default("case_insensitive", ParamType::Boolean, false, "Ignore case"),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        into_tool_result(self.name(), self.run(params, ctx).await)
    }
}
