//! Integration tests for the built-in tools.
//!
//! These tests run the tools through a real `ToolRegistry` and executor
//! chain, the same path the agent loop takes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kestrel_adapters::register_builtin_tools;
use kestrel_agent::tools::value::params_from_json;
use kestrel_agent::{
    AgentContext, AutoApprove, ExecutorChain, SnapshotLimits, SnapshotStore, ToolCall,
    ToolExecutor, ToolRegistry,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry);
    Arc::new(registry)
}

fn call(tool: &str, params: serde_json::Value) -> ToolCall {
    ToolCall::new(tool, params_from_json(params))
}

// ═══════════════════════════════════════════════════════════════════════
//  Registration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn builtin_tools_register_in_order() {
    let registry = registry();
    assert_eq!(
        registry.names(),
        vec![
            "read_file",
            "write_file",
            "update_file",
            "delete_file",
            "create_directory",
            "list_directory",
            "search_files",
            "run_command",
        ]
    );
    for schema in registry.all_tool_schemas() {
        assert!(!schema.description.is_empty(), "{} has no description", schema.name);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Filesystem lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn filesystem_lifecycle_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AgentContext::new(dir.path());
    let registry = registry();

    let result = registry
        .execute(
            "write_file",
            &params_from_json(json!({"path": "src/lib.rs", "content": "pub fn a() {}\n"})),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.as_ref().unwrap()["created"], true);

    let result = registry
        .execute(
            "update_file",
            &params_from_json(json!({
                "path": "src/lib.rs",
                "old_text": "pub fn a() {}",
                "new_text": "pub fn b() {}",
            })),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert!(result.success, "{:?}", result.error);

    let result = registry
        .execute(
            "read_file",
            &params_from_json(json!({"path": "src/lib.rs"})),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert_eq!(result.data.unwrap()["content"], "pub fn b() {}\n");

    let result = registry
        .execute(
            "list_directory",
            &params_from_json(json!({"recursive": true})),
            &ctx,
            TIMEOUT,
        )
        .await;
    let data = result.data.unwrap();
    let names: Vec<_> = data["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(names, vec!["src/", "src/lib.rs"]);

    let result = registry
        .execute(
            "delete_file",
            &params_from_json(json!({"path": "src/lib.rs"})),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert!(result.success);
    assert!(!dir.path().join("src/lib.rs").exists());

    // Reading a missing file is a failed result, not a panic.
    let result = registry
        .execute(
            "read_file",
            &params_from_json(json!({"path": "src/lib.rs"})),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert!(!result.success);
}

#[tokio::test]
async fn paths_outside_workspace_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AgentContext::new(dir.path().join("project"));
    std::fs::create_dir_all(&ctx.working_directory).unwrap();
    let registry = registry();

    for (tool, params) in [
        ("read_file", json!({"path": "../secret.txt"})),
        ("write_file", json!({"path": "../escape.txt", "content": "x"})),
        ("list_directory", json!({"path": ".."})),
        ("search_files", json!({"pattern": "x", "path": "/"})),
    ] {
        let result = registry
            .execute(tool, &params_from_json(params), &ctx, TIMEOUT)
            .await;
        assert!(!result.success, "{tool} escaped the workspace");
        assert!(
            result.error.as_deref().unwrap().contains("outside the working directory"),
            "{tool}: {:?}",
            result.error
        );
    }
    assert!(!dir.path().join("escape.txt").exists());
}

#[tokio::test]
async fn missing_required_parameter_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AgentContext::new(dir.path());

    let result = registry()
        .execute("write_file", &params_from_json(json!({"path": "a.txt"})), &ctx, TIMEOUT)
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("missing required parameter `content`"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Search
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn search_files_filters_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.rs"), "let needle = 1;\n").unwrap();
    std::fs::write(dir.path().join("b.md"), "needle in docs\n").unwrap();
    let ctx = AgentContext::new(dir.path());

    let result = registry()
        .execute(
            "search_files",
            &params_from_json(json!({"pattern": "NEEDLE", "extension": "rs", "case_insensitive": true})),
            &ctx,
            TIMEOUT,
        )
        .await;
    let data = result.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["matches"][0]["path"], "a.rs");
}

// ═══════════════════════════════════════════════════════════════════════
//  Shell
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn run_command_sees_context_environment() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = AgentContext::new(dir.path());
    ctx.environment
        .insert("KESTREL_TEST_VALUE".into(), "from-context".into());

    let result = registry()
        .execute(
            "run_command",
            &params_from_json(json!({"command": "printf %s \"$KESTREL_TEST_VALUE\""})),
            &ctx,
            TIMEOUT,
        )
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data.unwrap()["stdout"], "from-context");
}

// ═══════════════════════════════════════════════════════════════════════
//  Executor chain with snapshots
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn snapshot_layer_restores_real_tool_effects() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "original").unwrap();
    let ctx = AgentContext::new(dir.path());
    let store = SnapshotStore::shared(SnapshotLimits::default());

    let executor = ExecutorChain::new(registry())
        .with_snapshots(Arc::clone(&store))
        .with_approval(Arc::new(AutoApprove))
        .build();

    let edit = call(
        "update_file",
        json!({"path": "notes.txt", "old_text": "original", "new_text": "edited"}),
    );
    assert!(executor.execute(&edit, &ctx, TIMEOUT).await.success);
    let create = call("write_file", json!({"path": "new.txt", "content": "fresh"}));
    assert!(executor.execute(&create, &ctx, TIMEOUT).await.success);

    let mut guard = store.lock().await;
    assert!(guard.commit(1, "edit notes").await.is_some());

    let report = guard.undo(0, 0).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
        "original"
    );
    assert!(!dir.path().join("new.txt").exists());
}
