//! Intention analysis.
//!
//! A single backend call classifies a request before the agent loop runs.
//! The result only enriches context; nothing downstream depends on it being
//! right.  When the backend fails or answers with something other than the
//! requested JSON, a keyword classifier built on an Aho-Corasick automaton
//! takes over.

use std::sync::{Arc, LazyLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::client::ChatBackend;
use crate::llm::retry::RetryPolicy;
use crate::llm::types::Message;
use crate::planner::{PlanningOutcome, extract_json_block};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" | "low" => Some(Self::Simple),
            "moderate" | "medium" => Some(Self::Moderate),
            "complex" | "high" => Some(Self::Complex),
            _ => None,
        }
    }
}

/// What the user is trying to do, as far as a quick look can tell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentionAnalysis {
    pub primary_intent: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub required_tools: Vec<String>,
    pub suggested_approach: String,
    pub complexity: Complexity,
    pub estimated_steps: u32,
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct IntentionAnalyzer {
    backend: Arc<dyn ChatBackend>,
    retry: RetryPolicy,
}

impl IntentionAnalyzer {
    pub fn new(backend: Arc<dyn ChatBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Classify `request`.  `available_tools` bounds `required_tools`.
    ///
    /// Only cancellation is returned as an error.
    pub async fn analyze_intent(
        &self,
        request: &str,
        available_tools: &[String],
        cancel: &CancellationToken,
    ) -> Result<PlanningOutcome<IntentionAnalysis>> {
        let messages = vec![
            Message::system(build_system_prompt(available_tools)),
            Message::user(request),
        ];

        let reply = self
            .retry
            .execute_with_retry("intention", cancel, || self.backend.send_message(&messages))
            .await;

        let (parsed, usage) = match reply {
            Ok(reply) => (parse_intention(&reply.content, available_tools), reply.usage),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => (Err(e), None),
        };

        match parsed {
            Ok(analysis) => {
                tracing::debug!(
                    intent = %analysis.primary_intent,
                    confidence = analysis.confidence,
                    tools = ?analysis.required_tools,
                    "intention analysed"
                );
                Ok(PlanningOutcome {
                    value: analysis,
                    usage,
                    used_fallback: false,
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "intention analysis failed, using keyword classifier");
                Ok(PlanningOutcome {
                    value: classify_by_keywords(request, available_tools),
                    usage,
                    used_fallback: true,
                })
            }
        }
    }
}

fn build_system_prompt(available_tools: &[String]) -> String {
    format!(
        r#"Classify the user's request for a coding assistant.

Available tools: {}

Respond with valid JSON only, in this exact structure:
{{
  "primary_intent": "short description of what the user wants",
  "confidence": 0.0,
  "required_tools": ["tool_name"],
  "suggested_approach": "one or two sentences",
  "complexity": "simple | moderate | complex",
  "estimated_steps": 1
}}"#,
        available_tools.join(", ")
    )
}

/// Parse the backend's JSON reply.  Unknown tools are dropped and
/// confidence is clamped.
pub fn parse_intention(text: &str, available_tools: &[String]) -> Result<IntentionAnalysis> {
    let json_str = extract_json_block(text);

    let v: Value =
        serde_json::from_str(json_str).map_err(|e| AgentError::PlanningParseFailure {
            reason: format!("failed to parse intention JSON: {e}"),
        })?;

    let primary_intent = v["primary_intent"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AgentError::PlanningParseFailure {
            reason: "intention JSON missing `primary_intent`".into(),
        })?
        .to_owned();

    let required_tools = v["required_tools"]
        .as_array()
        .map(|arr| {
            let mut tools: Vec<String> = Vec::new();
            for name in arr.iter().filter_map(Value::as_str) {
                if available_tools.iter().any(|t| t == name) && !tools.iter().any(|t| t == name) {
                    tools.push(name.to_owned());
                }
            }
            tools
        })
        .unwrap_or_default();

    let confidence = v["confidence"].as_f64().unwrap_or(0.5);
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.5
    };

    let complexity = v["complexity"]
        .as_str()
        .and_then(Complexity::parse)
        .unwrap_or_else(|| complexity_for(required_tools.len(), 0));

    let estimated_steps = v["estimated_steps"]
        .as_u64()
        .map(|n| n as u32)
        .unwrap_or(required_tools.len() as u32)
        .max(1);

    Ok(IntentionAnalysis {
        primary_intent,
        confidence,
        required_tools,
        suggested_approach: v["suggested_approach"].as_str().unwrap_or_default().to_owned(),
        complexity,
        estimated_steps,
    })
}

// ---------------------------------------------------------------------------
// Keyword classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Modify,
    Explore,
    Execute,
}

const KEYWORDS: &[(&str, Category)] = &[
    ("file", Category::Modify),
    ("bug", Category::Modify),
    ("fix", Category::Modify),
    ("implement", Category::Modify),
    ("error", Category::Modify),
    ("refactor", Category::Modify),
    ("change", Category::Modify),
    ("update", Category::Modify),
    ("workspace", Category::Explore),
    ("structure", Category::Explore),
    ("overview", Category::Explore),
    ("project", Category::Explore),
    ("explore", Category::Explore),
    ("run", Category::Execute),
    ("test", Category::Execute),
    ("build", Category::Execute),
    ("command", Category::Execute),
];

static KEYWORD_AUTOMATON: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    let patterns: Vec<&str> = KEYWORDS.iter().map(|(k, _)| *k).collect();
    match AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(&patterns)
    {
        Ok(ac) => Some(ac),
        Err(e) => {
            tracing::error!(error = %e, "failed to build keyword automaton");
            None
        }
    }
});

/// Deterministic classification from keywords.  Keywords match at the start
/// of a word, so "files" and "testing" count but "prefix" does not.
pub fn classify_by_keywords(request: &str, available_tools: &[String]) -> IntentionAnalysis {
    let mut modify = false;
    let mut explore = false;
    let mut execute = false;

    if let Some(ac) = KEYWORD_AUTOMATON.as_ref() {
        let bytes = request.as_bytes();
        for mat in ac.find_iter(request) {
            let at_word_start = mat.start() == 0 || !bytes[mat.start() - 1].is_ascii_alphanumeric();
            if !at_word_start {
                continue;
            }
            match KEYWORDS[mat.pattern().as_usize()].1 {
                Category::Modify => modify = true,
                Category::Explore => explore = true,
                Category::Execute => execute = true,
            }
        }
    }

    let mut candidates: Vec<&str> = Vec::new();
    if explore {
        candidates.push("list_directory");
    }
    if modify {
        candidates.extend(["search_files", "read_file", "update_file"]);
    }
    if execute {
        candidates.push("run_command");
    }

    let required_tools: Vec<String> = candidates
        .into_iter()
        .filter(|name| available_tools.iter().any(|t| t == name))
        .map(str::to_owned)
        .collect();

    let (primary_intent, suggested_approach) = match (modify, explore, execute) {
        (true, true, _) => (
            "explore the workspace, then change code",
            "List the workspace first, locate the relevant files, then read and edit them.",
        ),
        (true, false, _) => (
            "change code",
            "Search for the relevant code, read it, then apply a targeted edit.",
        ),
        (false, true, _) => (
            "explore the workspace",
            "List the workspace structure before answering.",
        ),
        (false, false, true) => (
            "run a command",
            "Run the command and report its output.",
        ),
        (false, false, false) => ("answer a question", "Answer directly without tools."),
    };

    let word_count = request.split_whitespace().count();

    IntentionAnalysis {
        primary_intent: primary_intent.into(),
        confidence: if modify || explore || execute { 0.5 } else { 0.3 },
        estimated_steps: required_tools.len().max(1) as u32,
        complexity: complexity_for(required_tools.len(), word_count),
        required_tools,
        suggested_approach: suggested_approach.into(),
    }
}

fn complexity_for(tool_count: usize, word_count: usize) -> Complexity {
    match (tool_count, word_count) {
        (0..=1, 0..=30) => Complexity::Simple,
        (0..=3, 0..=80) => Complexity::Moderate,
        _ => Complexity::Complex,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
