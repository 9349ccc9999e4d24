//! Exposes the command line application.
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxycache_service::config::Config;

use crate::{logging, metrics, snapshot};

/// Inspect and manage the cache snapshot of proxycache.
#[derive(Debug, Parser)]
#[command(
    bin_name = "proxycache",
    version,
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        "\ngit commit: ",
        env!("PROXYCACHE_GIT_VERSION")
    ),
)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Proxycache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Work with the snapshot file the cache is persisted to.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    /// List the entries of the snapshot file.
    Show,
    /// Remove all entries from the snapshot file.
    ///
    /// The next start of the cache will be cold.
    Clear,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure(&config.metrics, statsd).context("failed to set up metrics")?;
    }

    match cli.command {
        Command::Snapshot(SnapshotCommand::Show) => {
            snapshot::show(&config, &mut io::stdout().lock())?
        }
        Command::Snapshot(SnapshotCommand::Clear) => snapshot::clear(&config)?,
    }

    Ok(())
}
