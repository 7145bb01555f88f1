//! `run_command`: execute a shell command in the working directory.
//!
//! Commands run through `sh -c` with the context's environment applied on
//! top of the inherited one.  Stdout and stderr are each truncated to
//! [`MAX_OUTPUT_BYTES`], and a command that outlives its timeout is killed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use kestrel_agent::tools::value::ParamValue;
use kestrel_agent::{AgentContext, ParamType, ParameterSpec, Tool, ToolParams, ToolResult};

use crate::error::{AdapterError, Result, into_tool_result};
use crate::filesystem::require_str;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum output size in bytes (100 KB), applied to each stream.
const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Exit status and captured output of a finished command.
struct CommandOutput {
    exit_code: i32,
    payload: Value,
    stderr_tail: String,
}

pub struct RunCommand;

impl RunCommand {
    async fn run(&self, params: &ToolParams, ctx: &AgentContext) -> Result<CommandOutput> {
        let command = require_str(params, "command", "run_command")?;
        let timeout_secs = params
            .get("timeout_secs")
            .and_then(ParamValue::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .max(1);

        debug!(
            command,
            working_dir = %ctx.working_directory.display(),
            timeout_secs,
            "executing shell command"
        );

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_directory)
            .envs(&ctx.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::ExecutionFailed {
                tool_name: "run_command".into(),
                reason: format!("failed to spawn process: {e}"),
            })?;

        // On timeout the child is dropped, and `kill_on_drop` reaps it.
        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AdapterError::ExecutionFailed {
                    tool_name: "run_command".into(),
                    reason: format!("process error: {e}"),
                });
            }
            Err(_) => {
                warn!(command, timeout_secs, "command timed out");
                return Err(AdapterError::Timeout {
                    seconds: timeout_secs,
                    reason: format!("command `{command}` exceeded its time limit"),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);
        debug!(exit_code, stdout_truncated, stderr_truncated, "command completed");

        let stderr_tail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_owned();

        Ok(CommandOutput {
            exit_code,
            stderr_tail,
            payload: json!({
                "command": command,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
                "stdout_truncated": stdout_truncated,
                "stderr_truncated": stderr_truncated,
            }),
        })
    }
}

/// Lossy UTF-8 conversion capped at [`MAX_OUTPUT_BYTES`].  Returns
/// `(output, was_truncated)`.
fn truncate_output(raw: &[u8]) -> (String, bool) {
    if raw.len() <= MAX_OUTPUT_BYTES {
        (String::from_utf8_lossy(raw).into_owned(), false)
    } else {
        let mut s = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).into_owned();
        s.push_str("\n... [output truncated at 100 KB]");
        (s, true)
    }
}

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the project directory and return its exit code, stdout and stderr"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::required("command", ParamType::String, "The shell command to execute"),
            ParameterSpec::with_default(
                "timeout_secs",
                ParamType::Number,
                DEFAULT_TIMEOUT_SECS as f64,
                "Seconds before the command is killed",
            ),
        ]
    }

    async fn execute(&self, params: &ToolParams, ctx: &AgentContext) -> ToolResult {
        match self.run(params, ctx).await {
            Ok(out) if out.exit_code == 0 => ToolResult::ok(out.payload),
            // A non-zero exit still carries the captured output.
            Ok(out) => {
                let mut error = format!("exit code {}", out.exit_code);
                if !out.stderr_tail.is_empty() {
                    error.push_str(": ");
                    error.push_str(&out.stderr_tail);
                }
                ToolResult {
                    data: Some(out.payload),
                    ..ToolResult::failure(error)
                }
            }
            Err(e) => into_tool_result(self.name(), Err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params(command: &str) -> ToolParams {
        let mut p = ToolParams::new();
        p.insert("command".into(), command.into());
        p
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let ctx = AgentContext::new(dir.path());

        let result = RunCommand.execute(&params("cat marker.txt"), &ctx).await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["stdout"], "here");
        assert_eq!(data["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(dir.path());

        let result = RunCommand
            .execute(&params("echo out; echo broken >&2; exit 3"), &ctx)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exit code 3: broken"));
        assert_eq!(result.data.unwrap()["stdout"], "out\n");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::new(dir.path());
        let mut p = params("sleep 5");
        p.insert("timeout_secs".into(), 1.0.into());

        let result = RunCommand.execute(&p, &ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("timeout after 1s"));
    }

    #[test]
    fn truncate_output_large_input_is_truncated() {
        let data = vec![b'x'; MAX_OUTPUT_BYTES + 1000];
        let (s, truncated) = truncate_output(&data);
        assert!(truncated);
        assert!(s.ends_with("[output truncated at 100 KB]"));

        let (short, truncated) = truncate_output(b"hello");
        assert_eq!(short, "hello");
        assert!(!truncated);
    }
}
