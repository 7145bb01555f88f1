//! Subcommands `kestrel chat` (interactive REPL) and `kestrel run` (one
//! request).
//!
//! Each turn gets its own [`CancellationToken`]; Ctrl-C during a turn
//! cancels it and the REPL keeps going.

use std::io::{self, Write as _};

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use kestrel_agent::{Role, TurnOutcome, TurnReport, UsageSource};

use crate::approval::{InputLines, read_line};
use crate::helpers::Session;

const HELP: &str = "\
  Commands:
    /undo       Revert the last turn (files and conversation)
    /redo       Re-apply the last undone turn
    /clear      Clear the conversation and snapshot history
    /history    Show the conversation so far
    /snapshots  List recorded file snapshots
    /usage      Show token usage
    /help       Show this help
    /exit       Quit (Ctrl-D works too)
  Ctrl-C interrupts the running turn.";

/// Run the interactive REPL.
pub async fn cmd_chat(mut session: Session, input: InputLines, label: &str) -> Result<()> {
    println!();
    println!("  Kestrel v{}", env!("CARGO_PKG_VERSION"));
    println!("  Backend: {label}");
    println!("  Project: {}", session.working_directory.display());
    if session.planning {
        println!("  Planning: enabled");
    }
    println!("  Type a request, or /help for commands.");
    println!();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = read_line(&input).await else {
            println!();
            info!("EOF received, exiting");
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.starts_with('/') {
            if !run_command(&mut session, trimmed).await {
                break;
            }
            continue;
        }

        let report = run_one_turn(&mut session, trimmed).await;
        print_report(&session, &report);
    }

    info!("shutting down");
    Ok(())
}

/// Run a single request and exit.  Fails when the turn did not complete.
pub async fn cmd_run(mut session: Session, prompt: &str) -> Result<()> {
    let report = run_one_turn(&mut session, prompt).await;
    print_report(&session, &report);

    match report.outcome {
        TurnOutcome::Completed { .. } => Ok(()),
        TurnOutcome::CapExhausted { .. } => bail!("iteration limit reached before an answer"),
        TurnOutcome::Failed { error } => Err(error.into()),
        TurnOutcome::Cancelled { .. } => bail!("interrupted"),
    }
}

async fn run_one_turn(session: &mut Session, input: &str) -> TurnReport {
    session.printer.begin_turn();

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let report = if session.planning {
        session
            .orchestrator
            .run_turn_with_planning(input, &cancel)
            .await
    } else {
        session.orchestrator.run_turn(input, &cancel).await
    };
    watcher.abort();
    report
}

fn print_report(session: &Session, report: &TurnReport) {
    let streamed = session.printer.streamed();
    match &report.outcome {
        TurnOutcome::Completed { answer } => {
            if streamed {
                println!();
            } else {
                println!("{answer}");
            }
        }
        TurnOutcome::CapExhausted { last_reply } => {
            if !streamed {
                println!("{last_reply}");
            } else {
                println!();
            }
            eprintln!(
                "  (stopped after {} iterations; ask me to continue)",
                report.stats.iterations
            );
        }
        TurnOutcome::Failed { error } => {
            if streamed {
                println!();
            }
            eprintln!("  Error: {error}");
        }
        TurnOutcome::Cancelled { .. } => {
            println!();
            eprintln!("  (interrupted)");
        }
    }

    let stats = &report.stats;
    if !stats.tools_used.is_empty() {
        eprintln!(
            "  ({} tool call{} in {:.1}s)",
            stats.tools_used.len(),
            if stats.tools_used.len() == 1 { "" } else { "s" },
            stats.duration.as_secs_f64()
        );
    }
    println!();
}

/// Handle a `/command`.  Returns false when the REPL should exit.
async fn run_command(session: &mut Session, command: &str) -> bool {
    let orch = &mut session.orchestrator;
    match command {
        "/exit" | "/quit" => return false,
        "/help" => println!("{HELP}"),
        "/clear" => {
            orch.reset_context().await;
            println!("  Conversation cleared.");
        }
        "/undo" => match orch.undo_last_turn().await {
            Some(report) => {
                println!(
                    "  Undid last turn: {} file(s) restored.",
                    report.restored.len()
                );
                for error in &report.errors {
                    eprintln!("  ! {error}");
                }
            }
            None => println!("  Nothing to undo."),
        },
        "/redo" => match orch.redo().await {
            Some(report) => {
                println!("  Redone: {} file(s) re-applied.", report.restored.len());
                for error in &report.errors {
                    eprintln!("  ! {error}");
                }
            }
            None => println!("  Nothing to redo."),
        },
        "/history" => {
            for message in &orch.context().history {
                let who = match message.role {
                    Role::User => "you",
                    Role::Assistant => "kestrel",
                    Role::Tool => "tool",
                    Role::System => "system",
                };
                let first = message.content.lines().next().unwrap_or("");
                println!("  [{who}] {}", clip(first, 100));
            }
        }
        "/snapshots" => {
            let store = session.snapshots.lock().await;
            if store.is_empty() {
                println!("  No snapshots.");
            }
            for snapshot in store.snapshots() {
                println!(
                    "  #{:<3} {}  {} file(s)  {}",
                    snapshot.message_index,
                    snapshot.timestamp.format("%H:%M:%S"),
                    snapshot.files.len(),
                    clip(&snapshot.message_preview, 60)
                );
            }
        }
        "/usage" => {
            let usage = orch.usage();
            let conversation = usage.total_for(UsageSource::Conversation);
            let planning = usage.total_for(UsageSource::Planning);
            println!(
                "  Conversation: {} in / {} out ({} calls)",
                conversation.input_tokens,
                conversation.output_tokens,
                usage.calls_for(UsageSource::Conversation)
            );
            println!(
                "  Planning:     {} in / {} out ({} calls)",
                planning.input_tokens,
                planning.output_tokens,
                usage.calls_for(UsageSource::Planning)
            );
            println!("  Total:        {}", usage.grand_total().total());
        }
        other => println!("  Unknown command `{other}`. Try /help."),
    }
    true
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        let mut out: String = text.chars().take(max).collect();
        out.push_str("...");
        out
    }
}
