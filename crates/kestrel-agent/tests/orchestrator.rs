//! Integration tests for the agent loop: iteration cap, tool chaining,
//! approval gating, planning and cancellation.

mod support;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kestrel_agent::context::{INTENTION_KEY, PLAN_KEY};
use kestrel_agent::{
    AgentContext, AgentSettings, AutoReject, ChatBackend, ChatReply, DeltaSink, ExecutorChain,
    Message, MessageStatus, Orchestrator, ParameterSpec, Result, RetryPolicy, Role, Tool,
    ToolParams, ToolRegistry, ToolResult, TurnObserver, TurnOutcome, UsageSource,
};

use support::{Recorder, StubBackend, WriteFile, write_directive};

fn build(
    backend: Arc<dyn ChatBackend>,
    registry: ToolRegistry,
    settings: AgentSettings,
) -> Orchestrator {
    let registry = Arc::new(registry);
    let executor = ExecutorChain::new(Arc::clone(&registry)).build();
    Orchestrator::new(backend, executor, registry, settings, RetryPolicy::no_retry())
}

fn recorders(log: &Arc<Mutex<Vec<String>>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for name in ["a", "b", "c"] {
        registry.register(Arc::new(Recorder {
            name,
            log: Arc::clone(log),
        }));
    }
    registry
}

const THREE_CALLS: &str = r#"[{"tool":"a","parameters":{}},{"tool":"b","parameters":{}},{"tool":"c","parameters":{}}]"#;

// ═══════════════════════════════════════════════════════════════════════
//  Iteration cap
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn always_calling_tools_halts_at_max_iterations() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let backend = StubBackend::with_fallback(vec![], r#"{"tool":"a","parameters":{}}"#);
    let settings = AgentSettings {
        max_iterations: 4,
        ..AgentSettings::default()
    };
    let mut orch = build(backend.clone(), recorders(&log), settings);

    let report = orch.run_turn("loop forever", &CancellationToken::new()).await;

    assert!(matches!(report.outcome, TurnOutcome::CapExhausted { .. }));
    assert_eq!(report.stats.iterations, 4);
    assert_eq!(backend.call_count(), 4);
    assert_eq!(log.lock().unwrap().len(), 4);
}

// ═══════════════════════════════════════════════════════════════════════
//  Tool chaining
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chaining_disabled_runs_only_first_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let backend = StubBackend::new(vec![Ok(THREE_CALLS.into()), Ok("finished".into())]);
    let settings = AgentSettings {
        tool_chaining: false,
        ..AgentSettings::default()
    };
    let mut orch = build(backend, recorders(&log), settings);

    let report = orch.run_turn("do three things", &CancellationToken::new()).await;

    assert!(matches!(report.outcome, TurnOutcome::Completed { .. }));
    assert_eq!(*log.lock().unwrap(), vec!["a"]);
}

#[tokio::test]
async fn chaining_enabled_runs_all_calls_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let backend = StubBackend::new(vec![Ok(THREE_CALLS.into()), Ok("finished".into())]);
    let mut orch = build(backend, recorders(&log), AgentSettings::default());

    let report = orch.run_turn("do three things", &CancellationToken::new()).await;

    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(report.stats.tools_used, vec!["a", "b", "c"]);

    let tool_names: Vec<&str> = orch
        .context()
        .history
        .iter()
        .filter_map(|m| m.tool_call.as_ref().map(|c| c.tool_name.as_str()))
        .collect();
    assert_eq!(tool_names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn tool_results_reach_the_model_as_enriched_blocks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let backend = StubBackend::new(vec![
        Ok(r#"{"tool":"a","parameters":{}}"#.into()),
        Ok("finished".into()),
    ]);
    let mut orch = build(backend.clone(), recorders(&log), AgentSettings::default());
    orch.run_turn("go", &CancellationToken::new()).await;

    let seen = backend.seen.lock().unwrap();
    let second_call = &seen[1];
    assert_eq!(second_call[0].role, Role::System);
    assert!(second_call[0].content.contains("### a"));
    let tool_msg = second_call.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.starts_with("[Tool Result: a]"));
    assert!(tool_msg.content.contains("Status: SUCCESS"));
}

#[tokio::test]
async fn unknown_tool_failure_is_visible_and_loop_continues() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let backend = StubBackend::new(vec![
        Ok(r#"{"tool":"nope","parameters":{}}"#.into()),
        Ok("sorry".into()),
    ]);
    let mut orch = build(backend, recorders(&log), AgentSettings::default());
    let report = orch.run_turn("go", &CancellationToken::new()).await;

    assert!(matches!(report.outcome, TurnOutcome::Completed { ref answer } if answer == "sorry"));
    let tool_msg = orch
        .context()
        .history
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    let result = tool_msg.tool_result.as_ref().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("unknown tool: nope"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Approval gating
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rejected_approval_never_runs_the_tool() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WriteFile::new();
    let runs = Arc::clone(&writer.runs);

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(writer));
    let registry = Arc::new(registry);
    let executor = ExecutorChain::new(Arc::clone(&registry))
        .with_approval(Arc::new(AutoReject::default()))
        .build();

    let backend = StubBackend::new(vec![
        Ok(write_directive("out.txt", "data")),
        Ok("ok, not writing".into()),
    ]);
    let mut orch = Orchestrator::new(
        backend,
        executor,
        registry,
        AgentSettings::default(),
        RetryPolicy::no_retry(),
    )
    .with_working_directory(dir.path());

    orch.run_turn("write it", &CancellationToken::new()).await;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("out.txt").exists());
    let result = orch
        .context()
        .history
        .iter()
        .find_map(|m| m.tool_result.clone())
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("rejected"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Timeouts
// ═══════════════════════════════════════════════════════════════════════

struct SlowThenFast {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for SlowThenFast {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps for `ms` milliseconds then records its label"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        Vec::new()
    }

    async fn execute(&self, params: &ToolParams, _ctx: &AgentContext) -> ToolResult {
        let ms = params.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let label = params
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_owned();
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.log.lock().unwrap().push(label.clone());
        ToolResult::ok(json!(label))
    }
}

#[tokio::test]
async fn timed_out_tool_does_not_leak_into_next_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SlowThenFast {
        log: Arc::clone(&log),
    }));

    let backend = StubBackend::new(vec![
        Ok(r#"[{"tool":"slow","parameters":{"ms":500,"label":"first"}},{"tool":"slow","parameters":{"ms":0,"label":"second"}}]"#.into()),
        Ok("done".into()),
    ]);
    let settings = AgentSettings {
        tool_timeout: Duration::from_millis(50),
        ..AgentSettings::default()
    };
    let mut orch = build(backend, registry, settings);
    orch.run_turn("go", &CancellationToken::new()).await;

    // Give a leaked future time to finish if it were still running.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let results: Vec<ToolResult> = orch
        .context()
        .history
        .iter()
        .filter_map(|m| m.tool_result.clone())
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error.as_deref(), Some("timeout"));
    assert_eq!(results[1].data, Some(json!("second")));
    assert_eq!(*log.lock().unwrap(), vec!["second"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Planning
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn planning_falls_back_and_is_accounted_separately() {
    let log = Arc::new(Mutex::new(Vec::new()));
    // Intention and plan replies are not JSON, so both fall back.
    let backend = StubBackend::new(vec![
        Ok("no idea".into()),
        Ok("still no idea".into()),
        Ok("the answer".into()),
    ]);
    let mut orch = build(backend.clone(), recorders(&log), AgentSettings::default());

    let report = orch
        .run_turn_with_planning("fix the bug in main.rs", &CancellationToken::new())
        .await;

    assert!(matches!(report.outcome, TurnOutcome::Completed { ref answer } if answer == "the answer"));
    assert_eq!(backend.call_count(), 3);
    assert_eq!(report.stats.iterations, 1);
    assert_eq!(report.stats.usage.total(), 15);
    assert_eq!(report.stats.planning_usage.total(), 30);
    assert_eq!(orch.usage().user_facing_total().total(), 15);
    assert_eq!(orch.usage().calls_for(UsageSource::Planning), 2);
    assert!(orch.context().metadata.contains_key(INTENTION_KEY));
    assert!(orch.context().metadata.contains_key(PLAN_KEY));

    // The advisory plan is folded into the loop's system prompt.
    let seen = backend.seen.lock().unwrap();
    assert!(seen[2][0].content.contains("Suggested plan"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation
// ═══════════════════════════════════════════════════════════════════════

/// Streams one delta, then hangs until dropped.
struct Hangs;

#[async_trait]
impl ChatBackend for Hangs {
    fn model(&self) -> &str {
        "hangs"
    }

    async fn send_message(&self, _messages: &[Message]) -> Result<ChatReply> {
        futures::future::pending().await
    }

    async fn send_message_stream(
        &self,
        _messages: &[Message],
        on_delta: DeltaSink<'_>,
    ) -> Result<ChatReply> {
        on_delta("partial answer");
        futures::future::pending().await
    }
}

#[derive(Default)]
struct CollectingObserver {
    deltas: Mutex<Vec<String>>,
}

impl TurnObserver for CollectingObserver {
    fn on_delta(&self, delta: &str) {
        self.deltas.lock().unwrap().push(delta.to_owned());
    }
}

#[tokio::test]
async fn cancellation_marks_partial_reply_interrupted() {
    let observer = Arc::new(CollectingObserver::default());
    let mut orch = build(Arc::new(Hangs), ToolRegistry::new(), AgentSettings::default())
        .with_observer(observer.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = orch.run_turn("long question", &cancel).await;

    match report.outcome {
        TurnOutcome::Cancelled { partial } => assert_eq!(partial, "partial answer"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    let last = orch.context().history.last().unwrap();
    assert_eq!(last.status, MessageStatus::Interrupted);
    assert_eq!(last.content, "partial answer");
    assert!(orch.context().history.iter().all(|m| m.role != Role::Tool));
    assert_eq!(*observer.deltas.lock().unwrap(), vec!["partial answer"]);
}
