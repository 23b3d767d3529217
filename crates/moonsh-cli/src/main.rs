//! moonsh - a small shell extended by Lua scripts
//!
//! Usage:
//!   moonsh                       Interactive prompt
//!   moonsh -c "command"          Run one command line
//!   moonsh script.lua [args...]  Run a script with `arg` set

mod collab;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use moonsh::BridgeConfig;

use crate::repl::{Interrupt, Mode, Shell};

/// moonsh - a shell whose prompt, input and commands can be scripted in Lua
#[derive(Parser, Debug)]
#[command(name = "moonsh", version)]
#[command(about = "Interactive shell extended by Lua scripts")]
struct Args {
    /// Run one command line and exit
    #[arg(short = 'c', long = "command", conflicts_with = "script")]
    command: Option<String>,

    /// Bridge configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not run startup scripts
    #[arg(long)]
    norc: bool,

    /// Extra directory of startup scripts (repeatable)
    #[arg(long = "script-dir")]
    script_dirs: Vec<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Lua script to run instead of the interactive prompt
    script: Option<PathBuf>,

    /// Arguments for the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn init_logging(default_directive: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log level {default_directive:?}"))?,
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    config.script_dirs.extend(args.script_dirs);
    if args.norc {
        config.load_startup = false;
    }
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mode = match (args.command, args.script) {
        (Some(line), _) => Mode::Command(line),
        (None, Some(path)) => Mode::Script {
            path,
            args: args.args,
        },
        (None, None) => Mode::Interactive,
    };

    let interrupt = Interrupt::default();
    let shell = Arc::new(Shell::new(config, interrupt.clone())?);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt");
            interrupt.fire();
        }
    });

    tokio::task::spawn_blocking(move || shell.run(mode))
        .await
        .context("shell thread panicked")?
}
