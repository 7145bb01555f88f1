//! Session configuration.
//!
//! A session is configured from a TOML file (every section optional) with
//! environment variables layered on top.  The sections map onto the runtime
//! types they configure: [`BackendConfig`] feeds the backend client,
//! [`AgentSection`] the orchestrator, [`RetrySection`] the retry policy and so
//! on.
//!
//! ```toml
//! [backend]
//! provider = "anthropic"
//! model = "claude-sonnet-4-20250514"
//!
//! [agent]
//! max_iterations = 15
//! tool_chaining = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::retry::RetryPolicy;
use crate::orchestrator::AgentSettings;
use crate::snapshot::SnapshotLimits;
use crate::tools::middleware::DEFAULT_SENSITIVE_TOOLS;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which backend to talk to and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Provider tag: `openai`, `anthropic`, `gemini`, `ollama` or
    /// `openai_compatible`.
    pub provider: String,
    pub model: String,
    /// Literal API key.  Prefer `api_key_env` outside of local testing.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Override for the provider's base URL.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Outbound history is truncated to roughly this many tokens.
    pub context_budget_tokens: usize,
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_tokens: 4096,
            temperature: None,
            context_budget_tokens: 100_000,
            connect_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    /// Resolve the API key: explicit value, then `api_key_env`, then the
    /// provider's conventional variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let non_empty = |s: String| (!s.trim().is_empty()).then_some(s);

        if let Some(key) = self.api_key.clone().and_then(non_empty) {
            return Some(key);
        }
        if let Some(var) = &self.api_key_env {
            if let Some(key) = std::env::var(var).ok().and_then(non_empty) {
                return Some(key);
            }
        }
        default_key_env(&self.provider)
            .and_then(|var| std::env::var(var).ok())
            .and_then(non_empty)
    }
}

/// Conventional API key variable for a provider tag.
pub fn default_key_env(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        _ => None,
    }
}

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    pub tool_chaining: bool,
    pub tool_timeout_secs: u64,
    /// When set, only these tools may be executed.
    pub allowed_tools: Option<Vec<String>>,
    pub streaming: bool,
    /// Run intention analysis and planning before each turn.
    pub planning: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tool_chaining: true,
            tool_timeout_secs: 30,
            allowed_tools: None,
            streaming: true,
            planning: false,
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            attempt_timeout_secs: policy.attempt_timeout.as_secs(),
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

/// Approval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    /// Tools that require confirmation before running.
    pub sensitive_tools: Vec<String>,
    /// Skip confirmation entirely.
    pub auto_approve: bool,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            sensitive_tools: DEFAULT_SENSITIVE_TOOLS.iter().map(|s| (*s).to_owned()).collect(),
            auto_approve: false,
        }
    }
}

/// Snapshot retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub max_snapshots: usize,
    pub max_file_bytes: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        let limits = SnapshotLimits::default();
        Self {
            max_snapshots: limits.max_snapshots,
            max_file_bytes: limits.max_file_bytes,
        }
    }
}

/// The assistant persona (system prompt preamble).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSection {
    pub text: Option<String>,
    /// Path to a file holding the persona, relative to the config file.
    pub file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Complete configuration for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backend: BackendConfig,
    pub agent: AgentSection,
    pub retry: RetrySection,
    pub approval: ApprovalSection,
    pub snapshots: SnapshotSection,
    pub persona: PersonaSection,

    /// Directory relative paths in the file are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl SessionConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AgentError::Config {
            reason: format!("invalid config: {e}"),
        })
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let mut config = Self::from_toml(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply `KESTREL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = get("KESTREL_PROVIDER") {
            self.backend.provider = provider;
        }
        if let Some(model) = get("KESTREL_MODEL") {
            self.backend.model = model;
        }
        if let Some(url) = get("KESTREL_BASE_URL") {
            self.backend.base_url = Some(url);
        }
        if let Some(key) = get("KESTREL_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(n) = get("KESTREL_MAX_ITERATIONS").and_then(|v| v.parse().ok()) {
            self.agent.max_iterations = n;
        }
    }

    /// Check values that would otherwise fail deep inside a turn.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(AgentError::Config {
                reason: "agent.max_iterations must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(AgentError::Config {
                reason: "retry.max_attempts must be at least 1".into(),
            });
        }
        if self.backend.model.trim().is_empty() {
            return Err(AgentError::Config {
                reason: "backend.model must not be empty".into(),
            });
        }
        Ok(())
    }

    /// The persona text, reading `persona.file` if configured.
    pub fn persona_text(&self) -> Result<Option<String>> {
        if let Some(text) = &self.persona.text {
            return Ok(Some(text.clone()));
        }
        let Some(file) = &self.persona.file else {
            return Ok(None);
        };
        let path = match &self.base_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.clone(),
        };
        let text = std::fs::read_to_string(&path).map_err(|e| AgentError::Config {
            reason: format!("cannot read persona file {}: {e}", path.display()),
        })?;
        Ok(Some(text))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            attempt_timeout: Duration::from_secs(self.retry.attempt_timeout_secs),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.agent.max_iterations,
            tool_chaining: self.agent.tool_chaining,
            tool_timeout: Duration::from_secs(self.agent.tool_timeout_secs),
            allowed_tools: self
                .agent
                .allowed_tools
                .as_ref()
                .map(|names| names.iter().cloned().collect::<HashSet<_>>()),
            streaming: self.agent.streaming,
        }
    }

    pub fn snapshot_limits(&self) -> SnapshotLimits {
        SnapshotLimits {
            max_snapshots: self.snapshots.max_snapshots,
            max_file_bytes: self.snapshots.max_file_bytes,
        }
    }
}
