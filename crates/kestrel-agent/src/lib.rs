//! Execution core of the Kestrel coding assistant.
//!
//! This crate turns one user request into a multi-turn, tool-using
//! conversation with a pluggable AI backend, gates side-effecting tools
//! behind host approval, and can undo/redo the file-system effects of a turn.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐     ┌──────────────┐
//! input ────>│ Orchestrator │────>│ Intention /  │  (optional, advisory)
//!            │ (agent loop) │     │ TaskPlanner  │
//!            └──┬────────┬──┘     └──────────────┘
//!               │        │
//!       ┌───────┴──┐  ┌──┴────────────────────────────────────┐
//!       │ LlmClient│  │ ExecutorChain                         │
//!       │ + Retry  │  │ ApprovalGate > SnapshotRecorder > Tool│
//!       └────┬─────┘  └──────────────────────┬────────────────┘
//!            │                               │
//!     ┌──────┴──────┐                 ┌──────┴───────┐
//!     │  Transport  │                 │ SnapshotStore│
//!     │ (HTTP, SSE) │                 │ (undo / redo)│
//!     └─────────────┘                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- Backend client, wire formats, streaming and retry.
//! - [`tools`] -- Tool trait, registry, parameter schemas and middleware.
//! - [`extraction`] -- Recovery of tool directives from model text.
//! - [`orchestrator`] -- The agent loop.
//! - [`intention`] / [`planner`] -- Pre-turn analysis with heuristic fallbacks.
//! - [`prompt`] -- System prompt and tool-result rendering.
//! - [`snapshot`] -- File snapshots for undo/redo.
//! - [`config`] -- TOML session configuration.
//! - [`usage`] -- Token accounting by source.
//! - [`error`] -- Error taxonomy.

pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod intention;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod snapshot;
pub mod tools;
pub mod usage;

// Re-export the most commonly used types at the crate root.
pub use config::{BackendConfig, SessionConfig};
pub use context::AgentContext;
pub use error::{AgentError, Result};
pub use extraction::{contains_tool_call, extract_tool_calls};
pub use intention::{Complexity, IntentionAnalysis, IntentionAnalyzer};
pub use llm::{
    ChatBackend, ChatReply, DeltaSink, LlmClient, LlmClientConfig, Message, MessageStatus,
    ProviderKind, RetryPolicy, Role, ToolCall, ToolResult, Usage, create_backend,
};
pub use orchestrator::{
    AgentSettings, Orchestrator, TurnObserver, TurnOutcome, TurnReport, TurnStats,
};
pub use planner::{ExecutionPlan, PlanningOutcome, TaskPlanner, TaskStep};
pub use snapshot::{
    ConversationSnapshot, FileSnapshot, RedoReport, SnapshotHandle, SnapshotLimits, SnapshotStore,
    UndoReport,
};
pub use tools::{
    ApprovalHandler, ApprovalRequest, AutoApprove, AutoReject, ExecutorChain, ParamType,
    ParamValue, ParameterSpec, SensitiveToolPolicy, Tool, ToolExecutor, ToolParams, ToolRegistry,
    ToolSchema,
};
pub use usage::{UsageLedger, UsageSource};
