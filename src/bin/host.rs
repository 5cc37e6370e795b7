//! memkv Host Binary
//!
//! Keeps one or more stores open and maintained for as long as it runs.
//!
//! After the initial store is up it prints `ready <name>` on stdout and then
//! reads line commands from stdin:
//!
//! ```text
//! start <name> [--max-key-size N ...] [--refresh-interval-ms N]
//! stop <name>
//! stats <name>
//! list
//! exit
//! ```
//!
//! When stdin is closed the host keeps serving until it is killed.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use memkv::{Config, Host, LogLevel, SyncStrategy};
use tracing_subscriber::{fmt, EnvFilter};

/// memkv Host
#[derive(Parser, Debug)]
#[command(name = "memkv-host")]
#[command(about = "Host process keeping memkv stores alive")]
#[command(version)]
struct Args {
    /// Store to host on startup
    #[arg(short, long)]
    name: String,

    /// Root directory of all stores
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    /// Log level when RUST_LOG is unset (off, error, warn, info, debug, trace or 0-5)
    #[arg(short, long, default_value = "info")]
    log_level: LogLevel,
}

/// Geometry and hosting options for one store
#[derive(clap::Args, Debug, Clone)]
struct StoreArgs {
    /// Max key length in bytes
    #[arg(long, default_value_t = 64)]
    max_key_size: usize,

    /// Max value length in bytes
    #[arg(long, default_value_t = 256)]
    max_value_size: usize,

    /// Blocks per segment file
    #[arg(long, default_value_t = 1000)]
    max_blocks_per_segment: usize,

    /// Max number of segment files
    #[arg(long, default_value_t = 100)]
    max_segment_count: usize,

    /// Max concurrent connections
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Flush every write to disk before returning
    #[arg(long)]
    sync_every_write: bool,

    /// Maintenance interval in milliseconds
    #[arg(long, default_value_t = 10_000)]
    refresh_interval_ms: u64,
}

impl StoreArgs {
    fn config(&self, name: &str, data_dir: &Path, log_level: LogLevel) -> Config {
        Config::builder()
            .name(name)
            .data_dir(data_dir)
            .max_key_size(self.max_key_size)
            .max_value_size(self.max_value_size)
            .max_blocks_per_segment(self.max_blocks_per_segment)
            .max_segment_count(self.max_segment_count)
            .max_connections(self.max_connections)
            .sync_strategy(if self.sync_every_write {
                SyncStrategy::EveryWrite
            } else {
                SyncStrategy::Deferred
            })
            .log_level(log_level)
            .build()
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// One line of stdin
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct CommandLine {
    #[command(subcommand)]
    command: HostCommand,
}

#[derive(Subcommand, Debug)]
enum HostCommand {
    /// Start hosting a store
    Start {
        name: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Stop hosting a store
    Stop { name: String },

    /// Print a hosted store's stats
    Stats { name: String },

    /// List hosted stores
    List,

    /// Stop everything and exit
    Exit,
}

enum Flow {
    Continue,
    Exit,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| Config::default().data_dir);

    tracing::info!("memkv host v{}", memkv::VERSION);
    tracing::info!("Data directory: {}", data_dir.display());

    let host = Host::new();
    let config = args.store.config(&args.name, &data_dir, args.log_level);
    if let Err(e) = host.start(config, args.store.refresh_interval()) {
        tracing::error!("Failed to start store '{}': {}", args.name, e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    reply(&format!("ready {}", args.name));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to read command: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match CommandLine::try_parse_from(line.split_whitespace()) {
            Ok(parsed) => parsed.command,
            Err(e) => {
                let message = e.to_string();
                reply(&format!(
                    "error: {}",
                    message.lines().next().unwrap_or("invalid command")
                ));
                continue;
            }
        };

        match execute(&host, &data_dir, args.log_level, command) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => {
                tracing::info!("Host exiting");
                return;
            }
            Err(e) => reply(&format!("error: {}", e)),
        }
    }

    tracing::info!("Command input closed, hosting until terminated");
    loop {
        std::thread::park();
    }
}

fn execute(
    host: &Host,
    data_dir: &Path,
    log_level: LogLevel,
    command: HostCommand,
) -> memkv::Result<Flow> {
    match command {
        HostCommand::Start { name, store } => {
            let config = store.config(&name, data_dir, log_level);
            if host.start(config, store.refresh_interval())? {
                reply(&format!("started {}", name));
            } else {
                reply(&format!("already running {}", name));
            }
        }
        HostCommand::Stop { name } => {
            if host.stop(&name)? {
                reply(&format!("stopped {}", name));
            } else {
                reply(&format!("not running {}", name));
            }
        }
        HostCommand::Stats { name } => match host.store(&name) {
            Some(store) => reply(&store.stats()?.to_string()),
            None => reply(&format!("not running {}", name)),
        },
        HostCommand::List => reply(&host.running().join(" ")),
        HostCommand::Exit => {
            let stopped = host.stop_all()?;
            reply(&format!("bye ({} stopped)", stopped));
            return Ok(Flow::Exit);
        }
    }
    Ok(Flow::Continue)
}

/// Write a response line and flush so pipe readers see it immediately
fn reply(message: &str) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", message);
    let _ = stdout.flush();
}
