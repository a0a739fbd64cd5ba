use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cotrust_core::trust::CotError;

mod chain_cli;

use chain_cli::ChainCommand;

#[derive(Parser, Debug)]
#[clap(
    name = "cotrust",
    about = "Generate and verify chain-of-trust statements for task pipelines",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: ChainCommand,

    /// Configuration file (default: ./.cotrust/config.yml, then the user config dir)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Set the logging level
    #[clap(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    log_json: bool,
}

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialize tracing; `RUST_LOG` directives win over `--log-level`
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr) // stdout carries command output
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<CotError>() {
        Some(cot) => {
            let task = cot.task_id().unwrap_or("-");
            eprintln!("Chain of trust failed [{}] (task {}): {:#}", cot.kind(), task, err);
        }
        None => eprintln!("Error: {err:#}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.log_json);

    if let Err(err) = cli.command.execute(cli.config.as_deref()).await {
        report_failure(&err);
        std::process::exit(1);
    }
    Ok(())
}
