//! `signalbus` — operate the transactional outbox from the command line.

mod config;
mod sender;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use signalbus_core::{SignalRegistry, SignalSender};
use signalbus_outbox::{FlushEngine, FlushSummary, PostgresOutboxStore};

use crate::config::Config;
use crate::sender::LogSender;

#[derive(Parser, Debug)]
#[command(name = "signalbus")]
#[command(about = "Flush and inspect transactional outbox tables")]
struct Cli {
    /// Path to the signal configuration file.
    #[arg(long, default_value = "signalbus.json")]
    config: PathBuf,

    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flush pending signals in small burst transactions.
    Flush {
        /// Signal types to flush; all registered types when omitted.
        signals: Vec<String>,

        /// Signal types to leave out.
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,

        /// When nothing is pending, wait up to this many seconds for new
        /// rows before flushing.
        #[arg(long)]
        wait: Option<f64>,
    },

    /// Work through a large backlog of pending signals.
    Flushmany {
        signals: Vec<String>,
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
    },

    /// Flush ordered signal types strictly by their order key.
    Flushordered {
        signals: Vec<String>,
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
    },

    /// List the registered signal types.
    Signals,

    /// Show pending-row counts per signal type.
    Pending,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let mut registry = SignalRegistry::new();
    for signal in config.signals {
        let descriptor = signal.into_descriptor()?;
        registry
            .register(descriptor, Arc::new(LogSender) as Arc<dyn SignalSender>)
            .context("registering signal types")?;
    }

    if let Command::Signals = cli.command {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    let store = PostgresOutboxStore::connect(&cli.database_url)
        .await
        .context("connecting to the database")?;
    for reg in registry.iter() {
        store.ensure_table(&reg.descriptor).await?;
    }
    let engine = FlushEngine::new(store, Arc::new(registry));

    match cli.command {
        Command::Flush {
            signals,
            exclude,
            wait,
        } => {
            let selected = select(engine.registry(), &signals, &exclude);
            let names: Vec<&str> = selected.iter().map(String::as_str).collect();
            let summary = engine
                .flush(Some(&names), wait.map(Duration::from_secs_f64))
                .await?;
            report(summary)
        }
        Command::Flushmany { signals, exclude } => {
            let selected = select(engine.registry(), &signals, &exclude);
            let names: Vec<&str> = selected.iter().map(String::as_str).collect();
            report(engine.flushmany(Some(&names)).await?)
        }
        Command::Flushordered { signals, exclude } => {
            let selected = select(engine.registry(), &signals, &exclude);
            let names: Vec<&str> = selected.iter().map(String::as_str).collect();
            report(engine.flushordered(Some(&names)).await?)
        }
        Command::Pending => {
            let mut total = 0u64;
            for row in engine.pending().await? {
                total += row.pending;
                println!("{}\t{}\t{}", row.signal, row.table, row.pending);
            }
            println!("Total pending: {total}");
            Ok(())
        }
        Command::Signals => unreachable!("handled before connecting"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Final list of type names for one invocation: the explicit list (or
/// every registered type), minus the excluded ones. Unknown names earn a
/// warning and are skipped, so the remaining types still get flushed;
/// only the engine's library API treats an unknown name as an error.
fn select(registry: &SignalRegistry, signals: &[String], exclude: &[String]) -> Vec<String> {
    for name in exclude {
        if registry.get(name).is_none() {
            warn!(signal = %name, "excluded signal type is not registered");
        }
    }
    let base: Vec<String> = if signals.is_empty() {
        registry.names().into_iter().map(str::to_string).collect()
    } else {
        signals
            .iter()
            .filter(|name| {
                let known = registry.get(name).is_some();
                if !known {
                    warn!(signal = %name, "no signal type with this name is registered");
                }
                known
            })
            .cloned()
            .collect()
    };
    base.into_iter()
        .filter(|name| !exclude.contains(name))
        .collect()
}

fn report(summary: FlushSummary) -> anyhow::Result<()> {
    println!("{} signals sent", summary.sent);
    if summary.is_complete() {
        return Ok(());
    }
    for failure in &summary.failures {
        eprintln!("{}: {}", failure.signal, failure.error);
    }
    anyhow::bail!("{} signal type(s) could not be flushed", summary.failures.len())
}
