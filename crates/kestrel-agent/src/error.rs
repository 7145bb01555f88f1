//! Agent error types.
//!
//! Every subsystem of the agent surfaces failures through [`AgentError`].  The
//! variants double as the retry taxonomy: [`AgentError::is_retryable`] is the
//! single place that decides whether a backend call may be attempted again.

/// Unified error type for the agent core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Backend configuration -----------------------------------------------
    /// The provider requires an API key and none was configured.
    #[error("missing api key for provider: {provider}")]
    MissingCredential { provider: String },

    /// The provider has no usable base URL.
    #[error("missing endpoint for provider: {provider}")]
    MissingEndpoint { provider: String },

    /// The configured provider tag is not one we know how to talk to.
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },

    // -- Backend transport ---------------------------------------------------
    /// Connection, DNS, TLS or per-attempt timeout failure.
    #[error("network failure: {reason}")]
    NetworkFailure { reason: String },

    /// The provider rejected our credentials (401/403).
    #[error("authentication failed ({status}): {body}")]
    AuthenticationFailure { status: u16, body: String },

    /// The provider is throttling us (429).
    #[error("rate limited: {body}")]
    RateLimited { body: String },

    /// The requested model does not exist on the provider.
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// The provider returned a 5xx.
    #[error("server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    /// Any other non-2xx status.
    #[error("api error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A 2xx response that carried no usable content.
    #[error("empty response from backend")]
    EmptyResponse,

    /// The stream broke or produced undecodable data.  `after_output` is true
    /// once at least one visible delta was handed to the caller.
    #[error("stream failure: {reason}")]
    StreamFailure { reason: String, after_output: bool },

    // -- Tools ---------------------------------------------------------------
    /// A tool did not finish within its timeout.
    #[error("tool `{tool_name}` timed out after {seconds}s")]
    ToolTimeout { tool_name: String, seconds: u64 },

    /// A directive referenced a tool that is not registered.
    #[error("unknown tool: {tool_name}")]
    ToolUnknown { tool_name: String },

    /// Parameter validation or tool execution failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecution { tool_name: String, reason: String },

    // -- Planning ------------------------------------------------------------
    /// An intention or plan reply could not be parsed.
    #[error("planning response parse failure: {reason}")]
    PlanningParseFailure { reason: String },

    // -- Control flow --------------------------------------------------------
    /// The turn was cancelled by the user.
    #[error("cancelled")]
    Cancelled,

    // -- Configuration -------------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization / IO --------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the retry policy may attempt the failed call again.
    ///
    /// Transient transport problems are retryable.  Anything that would fail
    /// identically on the next attempt (bad credentials, unknown model,
    /// malformed request) is not.  A stream that already emitted output is
    /// never retried so the caller does not see duplicated text.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::EmptyResponse => true,
            Self::StreamFailure { after_output, .. } => !after_output,
            _ => false,
        }
    }

    /// Short user-facing label for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential { .. } => "missing credential",
            Self::MissingEndpoint { .. } => "missing endpoint",
            Self::UnknownProvider { .. } => "unknown provider",
            Self::NetworkFailure { .. } => "network failure",
            Self::AuthenticationFailure { .. } => "authentication failure",
            Self::RateLimited { .. } => "rate limited",
            Self::ModelNotFound { .. } => "model not found",
            Self::ServerError { .. } => "server error",
            Self::ApiError { .. } => "api error",
            Self::EmptyResponse => "empty response",
            Self::StreamFailure { .. } => "stream failure",
            Self::ToolTimeout { .. } => "tool timeout",
            Self::ToolUnknown { .. } => "unknown tool",
            Self::ToolExecution { .. } => "tool execution error",
            Self::PlanningParseFailure { .. } => "planning parse failure",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "config error",
            Self::Json(_) => "json error",
            Self::Io(_) => "io error",
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkFailure {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(
            AgentError::NetworkFailure {
                reason: "reset".into()
            }
            .is_retryable()
        );
        assert!(AgentError::RateLimited { body: String::new() }.is_retryable());
        assert!(
            AgentError::ServerError {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(AgentError::EmptyResponse.is_retryable());
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(
            !AgentError::AuthenticationFailure {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !AgentError::ModelNotFound {
                model: "x".into()
            }
            .is_retryable()
        );
        assert!(
            !AgentError::MissingCredential {
                provider: "openai".into()
            }
            .is_retryable()
        );
        assert!(!AgentError::Cancelled.is_retryable());
        assert!(
            !AgentError::ApiError {
                status: 400,
                body: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn stream_failure_retryable_only_before_output() {
        let before = AgentError::StreamFailure {
            reason: "eof".into(),
            after_output: false,
        };
        let after = AgentError::StreamFailure {
            reason: "eof".into(),
            after_output: true,
        };
        assert!(before.is_retryable());
        assert!(!after.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = AgentError::ToolTimeout {
            tool_name: "run_command".into(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "tool `run_command` timed out after 30s");
        assert_eq!(err.kind(), "tool timeout");
    }
}
