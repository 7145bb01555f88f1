//! CLI entry point for Kestrel.
//!
//! This binary provides the `kestrel` command: an interactive REPL
//! (`kestrel chat`, the default) and a one-shot mode (`kestrel run`).

mod approval;
mod cli;
mod helpers;
mod repl;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal; anything else is worth a warning once
    // tracing is up.
    let dotenv = dotenvy::dotenv();
    helpers::init_tracing(cli.verbose);
    if let Err(e) = &dotenv
        && !e.not_found()
    {
        tracing::warn!(error = %e, "failed to load .env");
    }

    let config = helpers::load_config(&cli)?;
    let label = format!("{} / {}", config.backend.provider, config.backend.model);
    info!(backend = %label, "starting kestrel");

    let input = approval::stdin_lines();
    let session = helpers::build_session(&cli, &config, input.clone())?;

    match &cli.command {
        None | Some(Commands::Chat) => repl::cmd_chat(session, input, &label).await,
        Some(Commands::Run { prompt }) => repl::cmd_run(session, &prompt.join(" ")).await,
    }
}
