//! Mutalab CLI: terminal front-end for guided perturbation experiments.
//!
//! `mutalab run` walks one experiment through upload, perturbation, sandbox
//! testing and analysis. `auth` and `config` manage the service token and settings.

mod commands;
mod render;
mod run;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Mutalab: upload, perturb, sandbox-test and score executables
#[derive(Parser, Debug)]
#[command(name = "mutalab", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for .mutalab/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (replaces user and workspace config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transformation service base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an experiment through all five stages
    Run(RunArgs),
    /// Manage the service auth token
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Values for `mutalab run`. Anything omitted is prompted for.
#[derive(clap::Args, Debug, Default, Clone)]
struct RunArgs {
    /// Executable to upload
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Perturbation to apply (defaults to the service's recommendation)
    #[arg(short, long)]
    perturbation: Option<String>,

    /// Where to save the variant
    #[arg(short, long)]
    download_to: Option<PathBuf>,

    /// Sandbox report for the original
    #[arg(long)]
    original_report: Option<PathBuf>,

    /// Sandbox report for the variant
    #[arg(long)]
    variant_report: Option<PathBuf>,

    /// Detection rate of the original, in percent
    #[arg(long)]
    original_rate: Option<String>,

    /// Detection rate of the variant, in percent
    #[arg(long)]
    variant_rate: Option<String>,

    /// Accept defaults and confirm sandbox testing without asking
    #[arg(short, long)]
    yes: bool,
}

#[derive(clap::Subcommand, Debug)]
enum AuthAction {
    /// Store a token in the OS keyring
    Login {
        /// Token value (prompted for if omitted)
        #[arg(long)]
        token: Option<String>,
    },
    /// Remove the stored token
    Logout,
    /// Show where the token would come from
    Status,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file locations
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "mutalab", "mutalab")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "mutalab.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("mutalab=debug,mutalab_core=debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let options = commands::GlobalOptions {
        workspace,
        config_file: cli.config,
        base_url: cli.base_url,
        quiet: cli.quiet,
    };
    commands::handle_command(cli.command, &options).await
}
