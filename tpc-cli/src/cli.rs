use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, bail};
use tpc_log::config::{DEFAULT_EXTENT_RADIX, DEFAULT_EXTENT_SIZE};
use tpc_log::{Log, LogConfig};
use tpc_transaction::service::DEFAULT_LOG_NAME;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::inspect;

/// Inspect two-phase commit coordinator logs.
#[derive(Debug, Parser)]
#[command(name = "tpc", version)]
pub struct Cli {
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every record between tail and head
    Dump {
        #[command(flatten)]
        log: LogArgs,

        /// Scan from head to tail
        #[arg(long)]
        descending: bool,
    },
    /// Print the restart data of a log
    Restart {
        #[command(flatten)]
        log: LogArgs,
    },
    /// List transactions a restart would have to recover
    InDoubt {
        #[command(flatten)]
        log: LogArgs,
    },
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Directory holding the log
    dir: PathBuf,

    /// Name of the log inside the directory
    #[arg(default_value = DEFAULT_LOG_NAME)]
    name: String,

    /// Extent size the log was written with
    #[arg(long, default_value_t = DEFAULT_EXTENT_SIZE)]
    extent_size: u64,

    /// Extent radix the log was written with
    #[arg(long, default_value_t = DEFAULT_EXTENT_RADIX)]
    extent_radix: u32,
}

impl LogArgs {
    fn open(&self) -> Result<Log> {
        let path = self.dir.join(&self.name);
        if !path.join("control").is_file() {
            bail!("no log named `{}` in {}", self.name, self.dir.display());
        }
        let config = LogConfig {
            extent_size: self.extent_size,
            extent_radix: self.extent_radix,
            ..LogConfig::with_base_dir(&self.dir)
        };
        debug!(dir = %self.dir.display(), name = %self.name, "opening log read-only");
        Log::open_read_only(&config, &self.name).into_diagnostic()
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    // Only fails when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

impl Cli {
    pub fn run(self) -> Result<()> {
        init_tracing(self.verbose);
        let mut out = io::stdout().lock();
        match self.command {
            Command::Dump { log, descending } => inspect::dump(&log.open()?, descending, &mut out),
            Command::Restart { log } => inspect::restart(&log.open()?, &mut out),
            Command::InDoubt { log } => inspect::in_doubt(log.open()?, &mut out),
        }?;
        out.flush().into_diagnostic()
    }
}
