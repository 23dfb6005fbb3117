//! # syncbridge Binary
//!
//! Loads configuration, wires up tracing, loads a script through
//! [`Handler`], and drives the cooperative event loop.
//! Upstream change events normally arrive from a collaborator running
//! on another thread and feeding [`Handler::event_sender`]; this binary
//! also accepts one-shot CLI subcommands for local testing, dispatched
//! through the same verb surface a real transport would use.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use syncbridge::config::Config;
use syncbridge::protocol::{Handler, Status, Verb};

#[derive(Parser)]
#[command(name = "syncbridge")]
#[command(about = "Compiles a replication script and routes upstream changes to backend plug-ins")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file; falls back to config.toml/config.local.toml/env
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load, analyze, translate, and run a script's event loop until stopped.
    Run { script: String },
    /// Load and analyze a script, print its diagnostics payload, and exit.
    Check { script: String },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_script(handler: &Handler, script: &str, autofollow: bool) -> anyhow::Result<serde_json::Value> {
    let loaded = handler.dispatch(Verb::Script {
        filename: script.to_string(),
        base: None,
        autofollow,
    });
    if loaded.status == Status::Error {
        anyhow::bail!("script load failed: {}", loaded.message);
    }
    Ok(loaded.payload.unwrap_or(serde_json::Value::Null))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path.to_string_lossy().as_ref())?,
        None => Config::load().unwrap_or_default(),
    };
    init_tracing(&config);

    match cli.command {
        Command::Check { script } => run_check(&config, &script),
        Command::Run { script } => run_loop(&config, &script),
    }
}

fn run_check(config: &Config, script: &str) -> anyhow::Result<()> {
    let handler = Handler::new(config);
    let payload = load_script(&handler, script, false)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_loop(config: &Config, script: &str) -> anyhow::Result<()> {
    let handler = Handler::new(config);
    load_script(&handler, script, true)?;

    tracing::info!(script, "script ready; entering event loop");

    // A real deployment hands `event_sender()` to the upstream
    // collaborator thread; `run_once` is the
    // cooperative loop body that recv's from that queue or falls
    // through to the periodic poll suspension point.
    let poll_interval = Duration::from_millis(config.script.poll_interval_ms);
    while handler.run_once(poll_interval) {}
    Ok(())
}
