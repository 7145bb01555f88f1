//! The agent loop.
//!
//! One turn takes a user message through any number of backend/tool
//! iterations to a final plain-text answer:
//!
//! ```text
//! Idle ──> Iterating(i) ──> reply has directives? ──yes──> ToolPhase ──> Iterating(i+1)
//!                  │                 │
//!                  │                 no ──> Done
//!                  └── i == max ──> CapExhausted
//! ```
//!
//! Everything the loop needs is injected: the backend, the tool executor
//! chain, the registry (for schemas), settings and the retry policy.  The
//! orchestrator owns the [`AgentContext`] and is the only writer of its
//! history.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::{AgentContext, INTENTION_KEY, PLAN_KEY};
use crate::error::{AgentError, Result};
use crate::extraction::extract_tool_calls;
use crate::intention::{IntentionAnalysis, IntentionAnalyzer};
use crate::llm::client::ChatBackend;
use crate::llm::retry::RetryPolicy;
use crate::llm::types::{ChatReply, Message, Role, ToolCall, ToolResult, Usage};
use crate::planner::{ExecutionPlan, TaskPlanner};
use crate::prompt::{self, DEFAULT_PERSONA};
use crate::snapshot::{RedoReport, SnapshotHandle, UndoReport};
use crate::tools::middleware::ToolExecutor;
use crate::tools::registry::ToolRegistry;
use crate::tools::value::ToolSchema;
use crate::usage::{UsageLedger, UsageSource};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Loop behaviour.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Backend calls per turn before the turn ends as cap-exhausted.
    pub max_iterations: u32,

    /// Execute every directive in a reply (true) or only the first.
    pub tool_chaining: bool,

    /// Deadline for a single tool execution.
    pub tool_timeout: Duration,

    /// When set, directives naming other tools are skipped silently.
    pub allowed_tools: Option<HashSet<String>>,

    /// Use the streaming backend call and forward deltas to the observer.
    pub streaming: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            tool_chaining: true,
            tool_timeout: Duration::from_secs(30),
            allowed_tools: None,
            streaming: true,
        }
    }
}

impl AgentSettings {
    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .is_none_or(|allowed| allowed.contains(tool_name))
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Live-display hook.  Every method defaults to a no-op.
pub trait TurnObserver: Send + Sync {
    /// A visible text fragment streamed from the backend.
    fn on_delta(&self, _delta: &str) {}

    /// A directive is about to run.
    fn on_tool_start(&self, _call: &ToolCall) {}

    /// A directive finished (successfully or not).
    fn on_tool_result(&self, _call: &ToolCall, _result: &ToolResult) {}
}

struct NoopObserver;

impl TurnObserver for NoopObserver {}

// ---------------------------------------------------------------------------
// Turn results
// ---------------------------------------------------------------------------

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The backend answered in plain text.
    Completed { answer: String },

    /// The iteration cap was reached while the model was still calling
    /// tools.
    CapExhausted { last_reply: String },

    /// A backend error ended the turn after retries.
    Failed { error: AgentError },

    /// The user cancelled.  `partial` is whatever text had streamed in.
    Cancelled { partial: String },
}

impl TurnOutcome {
    /// The text to show the user for this outcome.
    pub fn display_text(&self) -> String {
        match self {
            Self::Completed { answer } => answer.clone(),
            Self::CapExhausted { last_reply } => last_reply.clone(),
            Self::Failed { error } => format!("Error: {error}"),
            Self::Cancelled { partial } => partial.clone(),
        }
    }
}

/// Bookkeeping recorded for every turn, whatever the outcome.
#[derive(Debug, Clone, Default)]
pub struct TurnStats {
    pub duration: Duration,
    /// Backend calls made by the loop (planning excluded).
    pub iterations: u32,
    /// Names of executed tools, in execution order.
    pub tools_used: Vec<String>,
    /// Conversation usage for this turn.
    pub usage: Usage,
    /// Intention analysis and planning usage for this turn.
    pub planning_usage: Usage,
}

#[derive(Debug)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub stats: TurnStats,
}

/// Planning results folded into one turn's system prompt.
struct TurnPlan {
    intention: IntentionAnalysis,
    plan: ExecutionPlan,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    executor: Arc<dyn ToolExecutor>,
    registry: Arc<ToolRegistry>,
    settings: AgentSettings,
    retry: RetryPolicy,
    persona: String,
    context: AgentContext,
    snapshots: Option<SnapshotHandle>,
    observer: Arc<dyn TurnObserver>,
    usage: UsageLedger,
    /// History removed by each undo, most recent last.
    /// Messages removed by each undo, with the history length they were
    /// cut at.
    redo_messages: Vec<(usize, Vec<Message>)>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        executor: Arc<dyn ToolExecutor>,
        registry: Arc<ToolRegistry>,
        settings: AgentSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            executor,
            registry,
            settings,
            retry,
            persona: DEFAULT_PERSONA.to_owned(),
            context: AgentContext::new("."),
            snapshots: None,
            observer: Arc::new(NoopObserver),
            usage: UsageLedger::new(),
            redo_messages: Vec::new(),
        }
    }

    /// Commit file snapshots at the end of each turn and enable undo/redo of
    /// file changes.  The same handle must be given to the executor chain's
    /// snapshot layer.
    pub fn with_snapshots(mut self, store: SnapshotHandle) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.context.working_directory = dir.into();
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    /// Replace the context wholesale.  Pending redo state is dropped, for
    /// files as well as messages.
    pub async fn set_context(&mut self, context: AgentContext) {
        self.context = context;
        self.redo_messages.clear();
        if let Some(store) = &self.snapshots {
            store.lock().await.clear_redo();
        }
    }

    /// Hard reset: clears history, metadata, snapshots and redo state.
    pub async fn reset_context(&mut self) {
        self.context.history.clear();
        self.context.metadata.clear();
        self.redo_messages.clear();
        if let Some(store) = &self.snapshots {
            store.lock().await.clear();
        }
        tracing::info!("context reset");
    }

    // -- Turns ---------------------------------------------------------------

    /// Run one turn.
    pub async fn run_turn(&mut self, input: &str, cancel: &CancellationToken) -> TurnReport {
        self.drive(input, cancel, false).await
    }

    /// Run intention analysis and planning first, then the same loop as
    /// [`Orchestrator::run_turn`].  The plan is advisory: it is stored in the
    /// context metadata and shown to the model for this turn only.
    pub async fn run_turn_with_planning(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
    ) -> TurnReport {
        self.drive(input, cancel, true).await
    }

    async fn drive(&mut self, input: &str, cancel: &CancellationToken, planning: bool) -> TurnReport {
        let started = Instant::now();
        let mut stats = TurnStats::default();

        self.redo_messages.clear();
        if let Some(store) = &self.snapshots {
            let mut store = store.lock().await;
            store.clear_redo();
            store.discard_pending();
        }

        self.context.history.push(Message::user(input));
        let message_index = self.context.history.len();

        tracing::info!(
            message_index,
            planning,
            max_iterations = self.settings.max_iterations,
            "turn started"
        );

        let outcome = self.run_loop(input, cancel, planning, &mut stats).await;

        if let Some(store) = &self.snapshots {
            store.lock().await.commit(message_index, input).await;
        }

        stats.duration = started.elapsed();
        tracing::info!(
            outcome = outcome_label(&outcome),
            iterations = stats.iterations,
            tools = stats.tools_used.len(),
            tokens = stats.usage.total(),
            duration_ms = stats.duration.as_millis() as u64,
            "turn finished"
        );

        TurnReport { outcome, stats }
    }

    async fn run_loop(
        &mut self,
        input: &str,
        cancel: &CancellationToken,
        planning: bool,
        stats: &mut TurnStats,
    ) -> TurnOutcome {
        let schemas = self.visible_schemas();

        let turn_plan = if planning {
            match self.plan_turn(input, &schemas, cancel, stats).await {
                Ok(plan) => Some(plan),
                Err(_) => {
                    return TurnOutcome::Cancelled {
                        partial: String::new(),
                    };
                }
            }
        } else {
            None
        };

        let system_prompt = prompt::build_system_prompt(
            &self.persona,
            &schemas,
            turn_plan.as_ref().map(|p| &p.plan),
            turn_plan.as_ref().map(|p| &p.intention),
        );

        let mut last_reply = String::new();

        for iteration in 1..=self.settings.max_iterations {
            stats.iterations = iteration;
            tracing::debug!(iteration, "loop iteration");

            let outbound = prompt::outbound_messages(system_prompt.clone(), &self.context.history);
            let (result, partial) = self.call_backend(&outbound, cancel).await;

            let reply = match result {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => return self.cancelled(partial),
                Err(error) => {
                    tracing::warn!(error = %error, kind = error.kind(), "turn failed");
                    self.context
                        .history
                        .push(Message::assistant_error(format!("Error: {error}")));
                    return TurnOutcome::Failed { error };
                }
            };

            self.usage.record(UsageSource::Conversation, reply.usage);
            if let Some(usage) = reply.usage {
                stats.usage.add(usage);
            }

            let calls = extract_tool_calls(&reply.content);
            self.context.history.push(Message::assistant(reply.content.clone()));

            if calls.is_empty() {
                return TurnOutcome::Completed {
                    answer: reply.content,
                };
            }

            tracing::info!(
                iteration,
                calls = calls.len(),
                tools = ?calls.iter().map(|c| c.tool_name.as_str()).collect::<Vec<_>>(),
                "model requested tools"
            );

            for call in calls {
                if !self.settings.is_allowed(&call.tool_name) {
                    tracing::debug!(tool = %call.tool_name, "tool not in allow-list, skipped");
                    continue;
                }
                if cancel.is_cancelled() {
                    return self.cancelled(String::new());
                }

                self.observer.on_tool_start(&call);
                let finished = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.executor.execute(&call, &self.context, self.settings.tool_timeout) => Some(result),
                };
                // A cancelled tool leaves no half-written entry behind.
                let Some(result) = finished else {
                    return self.cancelled(String::new());
                };
                self.observer.on_tool_result(&call, &result);

                if !result.success {
                    tracing::warn!(
                        tool = %call.tool_name,
                        error = result.error.as_deref().unwrap_or_default(),
                        "tool failed"
                    );
                }

                stats.tools_used.push(call.tool_name.clone());
                self.context.history.push(Message::tool(call, result));

                if !self.settings.tool_chaining {
                    break;
                }
            }

            last_reply = reply.content;
        }

        tracing::warn!(
            max_iterations = self.settings.max_iterations,
            "iteration cap reached"
        );
        TurnOutcome::CapExhausted { last_reply }
    }

    /// One backend call through the retry policy.  Returns the streamed text
    /// seen so far alongside the result, for the cancellation path.
    async fn call_backend(
        &self,
        outbound: &[Message],
        cancel: &CancellationToken,
    ) -> (Result<ChatReply>, String) {
        let partial = Mutex::new(String::new());

        let result = if self.settings.streaming {
            let observer = &self.observer;
            let sink = |delta: &str| {
                if cancel.is_cancelled() {
                    return;
                }
                if let Ok(mut buf) = partial.lock() {
                    buf.push_str(delta);
                }
                observer.on_delta(delta);
            };

            let emitted = || partial.lock().map(|buf| !buf.is_empty()).unwrap_or(true);
            let result = self
                .retry
                .execute_with_retry_while(
                    "chat",
                    cancel,
                    || self.backend.send_message_stream(outbound, &sink),
                    || !emitted(),
                )
                .await;

            // Deltas already on screen cannot be taken back, so a failure
            // after output is final whatever its class.
            match result {
                Err(err) if err.is_retryable() && emitted() => Err(AgentError::StreamFailure {
                    reason: err.to_string(),
                    after_output: true,
                }),
                other => other,
            }
        } else {
            let result = self
                .retry
                .execute_with_retry("chat", cancel, || self.backend.send_message(outbound))
                .await;
            if let Ok(reply) = &result {
                if !cancel.is_cancelled() {
                    self.observer.on_delta(&reply.content);
                }
            }
            result
        };

        let partial = partial.lock().map(|buf| buf.clone()).unwrap_or_default();
        (result, partial)
    }

    fn cancelled(&mut self, partial: String) -> TurnOutcome {
        tracing::info!(partial_chars = partial.len(), "turn cancelled");
        if !partial.is_empty() {
            self.context
                .history
                .push(Message::assistant_interrupted(partial.clone()));
        }
        TurnOutcome::Cancelled { partial }
    }

    /// Schemas of the tools the model may call.
    fn visible_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .all_tool_schemas()
            .into_iter()
            .filter(|s| self.settings.is_allowed(&s.name))
            .collect()
    }

    /// Errors only on cancellation; everything else falls back.
    async fn plan_turn(
        &mut self,
        input: &str,
        schemas: &[ToolSchema],
        cancel: &CancellationToken,
        stats: &mut TurnStats,
    ) -> Result<TurnPlan> {
        let tool_names: Vec<String> = schemas.iter().map(|s| s.name.clone()).collect();

        let analyzer = IntentionAnalyzer::new(Arc::clone(&self.backend), self.retry.clone());
        let intention = analyzer.analyze_intent(input, &tool_names, cancel).await?;
        self.record_planning(intention.usage, stats);

        let planner = TaskPlanner::new(Arc::clone(&self.backend), self.retry.clone());
        let plan = planner
            .create_plan(input, &intention.value, schemas, cancel)
            .await?;
        self.record_planning(plan.usage, stats);

        tracing::info!(
            intent = %intention.value.primary_intent,
            intention_fallback = intention.used_fallback,
            steps = plan.value.steps.len(),
            plan_fallback = plan.used_fallback,
            "turn planned"
        );

        if let Ok(value) = serde_json::to_value(&intention.value) {
            self.context.metadata.insert(INTENTION_KEY.to_owned(), value);
        }
        if let Ok(value) = serde_json::to_value(&plan.value) {
            self.context.metadata.insert(PLAN_KEY.to_owned(), value);
        }

        Ok(TurnPlan {
            intention: intention.value,
            plan: plan.value,
        })
    }

    fn record_planning(&mut self, usage: Option<Usage>, stats: &mut TurnStats) {
        self.usage.record(UsageSource::Planning, usage);
        if let Some(usage) = usage {
            stats.planning_usage.add(usage);
        }
    }

    // -- Undo / redo ---------------------------------------------------------

    /// Truncate the history to `message_index` messages and roll back file
    /// changes made after that point.  Returns `None` when there is nothing
    /// past `message_index`.
    pub async fn undo_to(&mut self, message_index: usize) -> Option<UndoReport> {
        if message_index >= self.context.history.len() {
            return None;
        }

        let removed = self.context.history.split_off(message_index);
        let report = match &self.snapshots {
            Some(store) => store.lock().await.undo(message_index, removed.len()).await,
            None => UndoReport::default(),
        };

        tracing::info!(
            message_index,
            removed_messages = removed.len(),
            restored = report.restored.len(),
            "undo"
        );
        self.redo_messages.push((message_index, removed));
        Some(report)
    }

    /// Undo everything since the most recent user message.
    pub async fn undo_last_turn(&mut self) -> Option<UndoReport> {
        let index = self
            .context
            .history
            .iter()
            .rposition(|m| m.role == Role::User)?;
        self.undo_to(index).await
    }

    /// Re-apply the most recent undo.  Returns `None`, keeping the redo
    /// entry, when there is nothing to redo or the history has changed length
    /// since the undo; files and messages are restored together or not at all.
    pub async fn redo(&mut self) -> Option<RedoReport> {
        let (cut_at, _) = self.redo_messages.last()?;
        if self.context.history.len() != *cut_at {
            tracing::warn!(
                history_len = self.context.history.len(),
                expected = *cut_at,
                "history moved since undo, redo refused"
            );
            return None;
        }
        let (cut_at, removed) = self.redo_messages.pop()?;

        let report = match &self.snapshots {
            Some(store) => store.lock().await.redo().await,
            None => None,
        }
        .unwrap_or_else(|| RedoReport {
            target_message_index: cut_at,
            removed_message_count: removed.len(),
            ..RedoReport::default()
        });

        self.context.history.extend(removed);
        Some(report)
    }
}

fn outcome_label(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Completed { .. } => "completed",
        TurnOutcome::CapExhausted { .. } => "cap_exhausted",
        TurnOutcome::Failed { .. } => "failed",
        TurnOutcome::Cancelled { .. } => "cancelled",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
