//! Per-session agent context.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::llm::types::Message;

/// Metadata key under which the latest intention analysis is stored.
pub const INTENTION_KEY: &str = "intention";

/// Metadata key under which the latest execution plan is stored.
pub const PLAN_KEY: &str = "plan";

/// Everything a turn reads and writes besides the injected capabilities.
///
/// One context exists per session; the orchestrator is its only writer while
/// a turn is running.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Append-only within a turn.  Undo truncates it.
    pub history: Vec<Message>,

    /// Relative tool paths resolve against this directory.
    pub working_directory: PathBuf,

    /// Extra environment passed to tools that spawn processes.
    pub environment: HashMap<String, String>,

    /// Free-form data attached by planning and hosts.
    pub metadata: HashMap<String, Value>,
}

impl AgentContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            history: Vec::new(),
            working_directory: working_directory.into(),
            environment: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Resolve a tool-supplied path against the working directory, without
    /// touching the filesystem.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            normalize_path(candidate)
        } else {
            normalize_path(&self.working_directory.join(candidate))
        }
    }

    /// Whether `path` lies inside the working directory.
    pub fn is_within_workspace(&self, path: &Path) -> bool {
        let root = normalize_path(&self.working_directory);
        path.starts_with(&root) && !path.components().any(|c| c == Component::ParentDir)
    }
}

/// Lexically normalise a path: drop `.` and fold `..` into its parent.
/// The path need not exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            _ => components.push(component),
        }
    }
    components.iter().collect()
}
