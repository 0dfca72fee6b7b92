//! actlog - durable action log for AI coding assistants.

use actlog_core::{quarantine_corrupt, ActlogError, Store};
use actlog_server::{commands, config, hook, logging, service};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use config::Config;
use logging::{LogConfig, LogFormat};
use service::{wait_for_signal, Service, ShutdownGuard};

/// actlog - record and search everything your coding assistant does.
#[derive(Parser, Debug)]
#[command(name = "actlog")]
#[command(about = "Durable, searchable action log for AI coding assistants")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging (INFO level for every target)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    trace: bool,

    /// Quiet mode (WARN and ERROR only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Set log level for specific targets (e.g., "queue=debug").
    /// Can be specified multiple times. Targets are prefixed with "actlog::" automatically.
    #[arg(long = "log", value_name = "TARGET=LEVEL", global = true)]
    log_overrides: Vec<String>,

    /// Log output format
    #[arg(long = "log-format", value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingest service until a termination signal arrives
    Serve {
        /// Move a corrupt data file aside and start with an empty store
        #[arg(long)]
        quarantine_corrupt: bool,
    },
    /// Handle one hook event (reads the hook JSON on stdin)
    Hook {
        /// Hook event name, e.g. PreToolUse
        event: String,
    },
    /// Record a consultation and print matching past actions
    Consult {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Drain all queues into the store once
    Drain,
    /// Print store statistics
    Stats,
    /// Search past actions by keyword
    Search {
        query: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_cli(
        cli.verbose,
        cli.debug,
        cli.trace,
        cli.quiet,
        cli.log_overrides,
        cli.log_format,
    );
    logging::init(&log_config);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    }
    .with_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Serve { quarantine_corrupt } => serve(config, quarantine_corrupt).await,
        Command::Hook { event } => run_hook(&config, &event),
        Command::Consult { query, limit } => print_json(&commands::consult(&config, &query, limit)?),
        Command::Drain => print_json(&commands::drain_once(&config)?),
        Command::Stats => print_json(&commands::stats(&config)?),
        Command::Search { query, limit } => print_json(&commands::search(&config, &query, limit)?),
    }
}

async fn serve(config: Config, quarantine: bool) -> Result<ExitCode> {
    let path = config.db_path();
    tracing::info!(target: "actlog::startup", "Opening store {}", path.display());

    let store = match Store::open_with(&path, config.store_options()) {
        Err(ActlogError::CorruptStore { reason, .. }) if quarantine => {
            tracing::error!(target: "actlog::startup", "Store is corrupt ({}), quarantining it", reason);
            let moved = quarantine_corrupt(&path)?;
            tracing::warn!(target: "actlog::startup", "Corrupt store kept at {}", moved.display());
            Store::open_with(&path, config.store_options())?
        }
        other => other.with_context(|| format!("opening store {}", path.display()))?,
    };

    let service = Service::new(Arc::new(store), config.queue_dir())
        .with_intervals(config.drain_interval(), config.flush_interval());
    let _guard = ShutdownGuard(service.shutdown());
    tracing::info!(target: "actlog::startup", "Watching queues in {}", config.queue_dir().display());

    let outcome = service
        .run_until(async {
            match wait_for_signal().await {
                Ok(name) => tracing::info!(target: "actlog::shutdown", "Received {}, shutting down", name),
                Err(e) => {
                    tracing::warn!(target: "actlog::shutdown", "Signal handlers unavailable ({}), waiting for ctrl-c", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        })
        .await;

    let code = outcome.map(|o| o.exit_code()).unwrap_or(0);
    Ok(ExitCode::from(code as u8))
}

fn run_hook(config: &Config, event: &str) -> Result<ExitCode> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading hook input")?;

    let outcome = hook::handle(event, &input, &config.gate(), &config.queue_writer());
    if let Some(stdout) = outcome.stdout {
        println!("{}", stdout);
    }
    if let Some(stderr) = outcome.stderr {
        eprintln!("{}", stderr);
    }
    Ok(ExitCode::from(outcome.exit_code as u8))
}

fn print_json<T: Serialize>(value: &T) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}
