//! memkv CLI Client
//!
//! One-shot command-line access to a store. Each invocation attaches to the
//! store, runs one command and detaches.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use memkv::{Config, LogLevel, MemKvError, Store};
use tracing_subscriber::{fmt, EnvFilter};

/// memkv CLI
#[derive(Parser, Debug)]
#[command(name = "memkv-cli")]
#[command(about = "CLI for memkv shared-memory stores")]
#[command(version)]
struct Args {
    /// Root directory of all stores
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Store name
    #[arg(short, long)]
    name: String,

    /// Create the store with default geometry if it does not exist
    #[arg(long)]
    create: bool,

    /// Log level when RUST_LOG is unset
    #[arg(short, long, default_value = "off")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Remove a key
    Remove {
        /// The key to remove
        key: String,
    },

    /// Print store stats
    Stats,

    /// Run one maintenance pass
    Maintain,

    /// Rebuild the key index from block contents
    Rebuild,

    /// Delete the store's files (fails while anyone is attached)
    Destroy,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| Config::default().data_dir);

    match run(&args, data_dir) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Execute the command; returns the process exit code
fn run(args: &Args, data_dir: PathBuf) -> memkv::Result<i32> {
    if let Commands::Destroy = args.command {
        let destroyed = Store::destroy(&data_dir, &args.name)?;
        println!("{}", if destroyed { "destroyed" } else { "absent" });
        return Ok(0);
    }

    let store = if args.create {
        Store::open(
            Config::builder()
                .name(args.name.as_str())
                .data_dir(&data_dir)
                .log_level(args.log_level)
                .build(),
        )?
    } else {
        Store::attach(&data_dir, &args.name)?
    };

    let code = match &args.command {
        Commands::Put { key, value } => {
            store.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
            0
        }
        Commands::Get { key } => match store.get(key.as_bytes())? {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                0
            }
            None => {
                println!("(nil)");
                2
            }
        },
        Commands::Remove { key } => match store.remove(key.as_bytes()) {
            Ok(()) => {
                println!("OK");
                0
            }
            Err(MemKvError::KeyNotFound) => {
                println!("(nil)");
                2
            }
            Err(e) => return Err(e),
        },
        Commands::Stats => {
            println!("{}", store.stats()?);
            0
        }
        Commands::Maintain => {
            println!("{:?}", store.maintain()?);
            0
        }
        Commands::Rebuild => {
            println!("{:?}", store.rebuild()?);
            0
        }
        Commands::Destroy => unreachable!("handled before attaching"),
    };

    store.dispose();
    Ok(code)
}
