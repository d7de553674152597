//! # SnapFS Gateway CLI (`snapfs-gateway`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snapfs-gateway serve` | Start the HTTP/WebSocket gateway |
//! | `snapfs-gateway canonicalize <path>...` | Print canonical forms of paths |
//! | `snapfs-gateway key --path .. --size .. --mtime ..` | Print the cache key for a file |
//!
//! ## Examples
//!
//! ```bash
//! # Local development with in-process tiers
//! REDIS_URL=memory:// NATS_URL=memory:// MYSQL_URL= snapfs-gateway serve
//!
//! # Production, settings from a file plus environment
//! snapfs-gateway --config /etc/snapfs/gateway.toml serve --bind 0.0.0.0:8000
//!
//! # Inspect the key a probe would use
//! snapfs-gateway key --path 'C:\show\a.exr' --size 1024 --mtime 1700000000.5
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use snapfs_gateway::cache_key::build_key;
use snapfs_gateway::paths::canonicalize;
use snapfs_gateway::{config, logging, server};

/// SnapFS Gateway: cache probes, event ingestion, and acknowledged event
/// streaming for the file-deduplication pipeline.
#[derive(Parser)]
#[command(name = "snapfs-gateway", version)]
struct Cli {
    /// Optional TOML configuration file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log level (`error`, `warn`, `info`, `debug`, `trace`).
    /// `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        /// Override the bind address (`server.bind` / `SNAPFS_BIND`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the canonical form of each path.
    Canonicalize {
        paths: Vec<String>,
    },

    /// Print the cache key for a file observation.
    Key {
        #[arg(long)]
        path: String,
        #[arg(long)]
        size: u64,
        /// Modification time in seconds; the fraction is dropped.
        #[arg(long)]
        mtime: f64,
        #[arg(long)]
        dev: Option<u64>,
        #[arg(long)]
        inode: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Canonicalize { paths } => {
            for path in paths {
                println!("{}", canonicalize(&path));
            }
        }
        Commands::Key {
            path,
            size,
            mtime,
            dev,
            inode,
        } => {
            println!("{}", build_key(&canonicalize(&path), size, mtime, dev, inode));
        }
        Commands::Serve { bind } => {
            logging::init_logging(&cli.log_level);
            let mut cfg = config::load_config(cli.config.as_deref())?;
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
