//! Shared helpers: tracing, config loading and session assembly.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use kestrel_agent::{
    AutoApprove, ExecutorChain, Orchestrator, SensitiveToolPolicy, SessionConfig, SnapshotHandle,
    SnapshotStore, ToolCall, ToolRegistry, ToolResult, TurnObserver, create_backend,
};

use crate::approval::{InputLines, TerminalApproval};
use crate::cli::Cli;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Load the config file, then layer environment and command-line overrides.
pub fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = SessionConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config.apply_env_overrides();

    if let Some(provider) = &cli.provider {
        config.backend.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.backend.model = model.clone();
    }
    if cli.auto_approve {
        config.approval.auto_approve = true;
    }
    if cli.plan {
        config.agent.planning = true;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything one REPL or one-shot run needs.
pub struct Session {
    pub orchestrator: Orchestrator,
    pub printer: Arc<StreamPrinter>,
    pub snapshots: SnapshotHandle,
    pub planning: bool,
    pub working_directory: PathBuf,
}

/// Wire the backend, tools, middleware and orchestrator together.
pub fn build_session(cli: &Cli, config: &SessionConfig, input: InputLines) -> Result<Session> {
    let working_directory = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    let working_directory = working_directory
        .canonicalize()
        .with_context(|| format!("cannot open {}", working_directory.display()))?;

    let persona = config.persona_text().context("failed to load persona")?;
    let backend =
        create_backend(&config.backend, persona.clone()).context("failed to create backend")?;

    let mut registry = ToolRegistry::new();
    kestrel_adapters::register_builtin_tools(&mut registry);
    let registry = Arc::new(registry);

    let snapshots = SnapshotStore::shared(config.snapshot_limits());
    let chain = ExecutorChain::new(Arc::clone(&registry)).with_snapshots(Arc::clone(&snapshots));
    let executor = if config.approval.auto_approve {
        chain.with_approval(Arc::new(AutoApprove)).build()
    } else {
        let policy = SensitiveToolPolicy::new(config.approval.sensitive_tools.iter().cloned());
        chain
            .with_approval(Arc::new(TerminalApproval::new(policy, input)))
            .build()
    };

    let printer = Arc::new(StreamPrinter::default());
    let mut orchestrator = Orchestrator::new(
        backend,
        executor,
        registry,
        config.agent_settings(),
        config.retry_policy(),
    )
    .with_snapshots(Arc::clone(&snapshots))
    .with_observer(printer.clone())
    .with_working_directory(working_directory.clone());
    if let Some(persona) = persona {
        orchestrator = orchestrator.with_persona(persona);
    }

    Ok(Session {
        orchestrator,
        printer,
        snapshots,
        planning: config.agent.planning,
        working_directory,
    })
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Prints streamed text to stdout and tool activity to stderr.
#[derive(Default)]
pub struct StreamPrinter {
    streamed: AtomicBool,
}

impl StreamPrinter {
    /// Forget what the previous turn printed.
    pub fn begin_turn(&self) {
        self.streamed.store(false, Ordering::Relaxed);
    }

    /// Whether any delta was printed since [`StreamPrinter::begin_turn`].
    pub fn streamed(&self) -> bool {
        self.streamed.load(Ordering::Relaxed)
    }
}

impl TurnObserver for StreamPrinter {
    fn on_delta(&self, delta: &str) {
        self.streamed.store(true, Ordering::Relaxed);
        print!("{delta}");
        std::io::stdout().flush().ok();
    }

    fn on_tool_start(&self, call: &ToolCall) {
        if self.streamed.swap(false, Ordering::Relaxed) {
            println!();
        }
        eprintln!("  -> {}", call.tool_name);
    }

    fn on_tool_result(&self, call: &ToolCall, result: &ToolResult) {
        if result.success {
            eprintln!("  <- {} ok", call.tool_name);
        } else {
            eprintln!(
                "  <- {} failed: {}",
                call.tool_name,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
