//! pipecheck CLI: verify pickled pipelines against their compiled scoring documents.

mod commands;

use clap::Parser;
use pipecheck_core::CaseConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// pipecheck: cross-format model verification
#[derive(Parser, Debug)]
#[command(name = "pipecheck", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Fixture root (overrides `fixtures_dir` from the configuration)
    #[arg(short, long, global = true)]
    fixtures: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run verification cases
    Run {
        /// Case to run as MODEL:DATASET (repeatable; defaults to the configured cases)
        #[arg(short, long = "case", value_parser = parse_case)]
        cases: Vec<CaseConfig>,

        /// Output field to leave out of the comparison (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Evaluate documents without nesting guards
        #[arg(long)]
        unguarded: bool,

        /// Absolute tolerance
        #[arg(long)]
        absolute: Option<f64>,

        /// Relative tolerance
        #[arg(long)]
        relative: Option<f64>,

        /// Print verdicts as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decode a pipeline fixture and describe it
    Inspect {
        /// MODEL:DATASET
        #[arg(value_parser = parse_case)]
        case: CaseConfig,
    },
    /// Compile a pipeline fixture and print the scoring document
    Compile {
        /// MODEL:DATASET
        #[arg(value_parser = parse_case)]
        case: CaseConfig,

        /// Write the document to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a default pipecheck.toml into the workspace
    Init,
    /// Show the effective configuration
    Config,
}

fn parse_case(value: &str) -> Result<CaseConfig, String> {
    match value.split_once(':') {
        Some((model, dataset)) if !model.is_empty() && !dataset.is_empty() => {
            Ok(CaseConfig::new(model, dataset))
        }
        _ => Err(format!("expected MODEL:DATASET, got '{value}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "pipecheck", "pipecheck")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "pipecheck.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.fixtures).await
}
