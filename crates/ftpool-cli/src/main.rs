//! Operator CLI over the FTP connection pool.
//!
//! # Usage
//!
//! ```text
//! ftpool --config ftp.toml check
//! ftpool --config ftp.toml ls /incoming
//! ftpool --config ftp.toml get /incoming/report.csv --output report.csv
//! ftpool --config ftp.toml put report.csv /outgoing/report.csv
//! ftpool --config ftp.toml rm /outgoing/report.csv
//! ftpool --config ftp.toml stats --format json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "ftpool",
    about = "Pooled FTP/FTPS client",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the TOML connection config.
    #[arg(short, long, global = true, default_value = "ftpool.toml")]
    config: PathBuf,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the config, run connection diagnostics and a live probe.
    Check,
    /// List a remote directory.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Download a remote file.
    Get {
        remote: String,
        /// Local destination (default: the remote file name).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a local file.
    Put { local: PathBuf, remote: String },
    /// Delete a remote file.
    Rm { remote: String },
    /// Run a live probe and print pool and health counters.
    Stats,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ftpool=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = commands::load_config(&cli.config)?;

    match cli.command {
        Command::Check => commands::check(config, cli.format).await,
        Command::Ls { path } => commands::ls(config, &path, cli.format).await,
        Command::Get { remote, output } => commands::get(config, &remote, output).await,
        Command::Put { local, remote } => commands::put(config, &local, &remote).await,
        Command::Rm { remote } => commands::rm(config, &remote).await,
        Command::Stats => commands::stats(config, cli.format).await,
    }
}
