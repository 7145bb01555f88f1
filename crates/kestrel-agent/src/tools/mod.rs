//! Tool layer.
//!
//! - [`value`] -- Tagged parameter values, parameter schemas and validation.
//! - [`registry`] -- The [`Tool`] trait and the name-indexed [`ToolRegistry`].
//! - [`middleware`] -- Executor chain: approval gating and snapshot capture.

pub mod middleware;
pub mod registry;
pub mod value;

pub use middleware::{
    ApprovalGate, ApprovalHandler, ApprovalRequest, AutoApprove, AutoReject,
    DEFAULT_SENSITIVE_TOOLS, ExecutorChain, RegistryExecutor, SensitiveToolPolicy,
    SnapshotRecorder, ToolExecutor, approval_preview,
};
pub use registry::{Tool, ToolRegistry};
pub use value::{
    ParamType, ParamValue, ParameterSpec, ToolParams, ToolSchema, params_from_json,
    params_to_json, validate_params,
};
