//! CLI argument definitions for Kestrel.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Kestrel -- a terminal AI coding assistant.
#[derive(Parser)]
#[command(
    name = "kestrel",
    version,
    about = "Kestrel -- terminal AI coding assistant",
    long_about = "Talks to an AI backend, lets it read and edit the files in your project \
                  through approved tool calls, and can undo what a turn changed."
)]
pub struct Cli {
    /// Path to the TOML session config.
    #[arg(long, short, global = true, default_value = "kestrel.toml")]
    pub config: PathBuf,

    /// Backend provider (`openai`, `anthropic`, `gemini`, `ollama`, ...).
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Model name sent to the backend.
    #[arg(long, short, global = true)]
    pub model: Option<String>,

    /// Project directory the tools operate in.  Defaults to the current
    /// directory.
    #[arg(long, short = 'd', global = true)]
    pub dir: Option<PathBuf>,

    /// Run sensitive tools without asking.
    #[arg(long, global = true)]
    pub auto_approve: bool,

    /// Run intention analysis and planning before each turn.
    #[arg(long, global = true)]
    pub plan: bool,

    /// Increase log verbosity (`-v` debug, `-vv` trace).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the interactive REPL (the default).
    Chat,

    /// Run a single request and exit.
    Run {
        /// The request to send.
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
}
