//! Terminal approval: asks on stdin before a sensitive tool runs.

use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use kestrel_agent::{ApprovalHandler, ApprovalRequest, SensitiveToolPolicy};

/// Line reader over stdin, shared by the REPL prompt and approval prompts.
pub type InputLines = Arc<Mutex<Lines<BufReader<Stdin>>>>;

pub fn stdin_lines() -> InputLines {
    use tokio::io::AsyncBufReadExt as _;
    Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

/// Read one line.  `None` on EOF or a read error.
pub async fn read_line(input: &InputLines) -> Option<String> {
    match input.lock().await.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read stdin");
            None
        }
    }
}

pub struct TerminalApproval {
    policy: SensitiveToolPolicy,
    input: InputLines,
}

impl TerminalApproval {
    pub fn new(policy: SensitiveToolPolicy, input: InputLines) -> Self {
        Self { policy, input }
    }
}

#[async_trait]
impl ApprovalHandler for TerminalApproval {
    fn needs_approval(&self, tool_name: &str) -> bool {
        self.policy.is_sensitive(tool_name)
    }

    async fn confirm(&self, request: &ApprovalRequest) -> bool {
        eprintln!();
        eprintln!("  [approval] {}", request.tool_name);
        for line in request.preview.lines() {
            eprintln!("    {line}");
        }
        eprint!("  Allow? [y/N] ");
        std::io::stderr().flush().ok();

        let answer = read_line(&self.input).await.unwrap_or_default();
        let approved = is_yes(&answer);
        tracing::debug!(tool = %request.tool_name, approved, "approval answered");
        approved
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
