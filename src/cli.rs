//! CLI struct definitions for the mongovisor command-line interface.
//!
//! All clap-derived types live here. Dispatch logic lives in `lib.rs`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default base directory for instance data.
pub const DEFAULT_DATA_DIR: &str = "/var/mongodb/data";
pub const DEFAULT_PORT: u16 = 27017;

#[derive(Parser, Debug)]
#[clap(
    name = "mongovisor",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local supervisor for mongod instances: create, start, stop, restart, delete and list."
)]
pub(crate) struct Cli {
    /// Supervisor root holding state, config, events and server logs.
    /// Defaults to $MONGOVISOR_ROOT, then ./.mongovisor.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Debug-level diagnostics on stderr (overridden by MONGOVISOR_LOG).
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct CreateCli {
    /// Unique instance name; also the data directory's final component.
    #[clap(long)]
    pub name: String,
    /// Base directory; the instance stores its data in `<data-dir>/<name>`.
    #[clap(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// TCP port the server listens on.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ListCli {
    /// Output format: 'table' or 'json'.
    #[clap(long, default_value = "table")]
    pub format: String,
    /// Annotate each instance with the server PID observed right now.
    #[clap(long)]
    pub live: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create an instance, start its server and wait until it is ready
    Create(CreateCli),
    /// Start a stopped instance (no-op when running)
    Start {
        /// Instance id (position in `list`)
        id: usize,
    },
    /// Stop a running instance (no-op when stopped)
    Stop {
        /// Instance id (position in `list`)
        id: usize,
    },
    /// Stop, confirm exit, then start again
    Restart {
        /// Instance id (position in `list`)
        id: usize,
    },
    /// Stop if needed and remove the instance; its data directory is kept
    Delete {
        /// Instance id (position in `list`); later ids shift down by one
        id: usize,
    },
    /// Show all instances with their ids
    #[clap(visible_alias = "ls")]
    List(ListCli),
    /// Correct recorded status against the live process table
    Reconcile,
}
