//! KVStore shell binary
//!
//! Runs a script of KVStore commands against a freshly initialised store.
//!
//! # Examples
//!
//! ```bash
//! # Interactive / piped
//! echo "set default greeting hello" | kvs-shell
//!
//! # Script file, buffered-transaction backend
//! kvs-shell --backend buffered script.kvs
//!
//! # Engine settings from a config file
//! kvs-shell --config kvstore.toml script.kvs
//! ```

use anyhow::Context;
use clap::Parser;
use photondb_kvstore::config::{KvsConfig, BACKEND_KEY};
use photondb_kvstore::shell::Shell;
use photondb_kvstore::KvStore;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Script runner for the PhotonDB KVStore
#[derive(Parser, Debug)]
#[command(name = "kvs-shell")]
#[command(version = photondb_kvstore::VERSION)]
#[command(about = "Run KVStore command scripts", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    /// Script to run (stdin when omitted)
    script: Option<PathBuf>,

    /// Configuration file (TOML, JSON, INI, ...)
    #[arg(short, long, env = "KVS_CONFIG")]
    config: Option<PathBuf>,

    /// Backend to use, overriding `kvstore.backend`
    #[arg(short, long)]
    backend: Option<String>,

    /// Environment variable prefix for configuration overrides
    #[arg(long, default_value = "KVS")]
    env_prefix: String,

    /// Log directory path
    #[arg(long, default_value = "logs", env = "KVS_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "KVS_LOG_LEVEL")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = load_config(&cli)?;
    let store = KvStore::open(&config).context("failed to initialize store")?;
    info!(backend = %store.metadata().name, "Store ready");

    let mut shell = Shell::new(store);
    let stdout = io::stdout();
    let summary = match &cli.script {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
            shell.run(BufReader::new(file), stdout.lock())?
        }
        None => shell.run(io::stdin().lock(), stdout.lock())?,
    };

    info!(executed = summary.executed, failed = summary.failed, "Script finished");
    if summary.failed > 0 {
        anyhow::bail!("{} of {} commands failed", summary.failed, summary.executed);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<KvsConfig> {
    let mut builder = KvsConfig::builder();
    if let Some(path) = &cli.config {
        builder = builder.file(path);
    }
    builder = builder.env_prefix(&cli.env_prefix);
    if let Some(backend) = &cli.backend {
        builder = builder.set(BACKEND_KEY, backend.as_str())?;
    }
    Ok(builder.build()?)
}

/// Setup logging with tracing
///
/// Stdout carries command output, so the console layer writes to stderr.
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "kvs-shell.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}
