//! Mongovisor: a local supervisor for database server instances.
//!
//! **Mongovisor keeps a durable registry of `mongod` instances on one host and
//! drives their processes through a small lifecycle.**
//!
//! Each invocation performs exactly one operation and exits. No daemon keeps
//! child handles around, so the OS process serving an instance is re-derived
//! from the process table on every call.
//!
//! # Core Principles
//!
//! - **Durable**: the registry (`instances.json`) is replaced atomically and
//!   guarded by an advisory lock across read-modify-write
//! - **Honest status**: `running` is only recorded after the server signalled
//!   readiness; `stopped` only after its exit was observed
//! - **Idempotent**: starting a running instance or stopping a stopped one
//!   changes nothing, including the state file
//! - **Auditable**: every operation appends `pending` and terminal lines to
//!   `lifecycle.events.jsonl`
//!
//! # Architecture
//!
//! ## Supervisor Root
//!
//! Resolved from `--root`, then `$MONGOVISOR_ROOT`, then `./.mongovisor`:
//!
//! - `instances.json` / `instances.lock`: registry and its lock
//! - `config.toml`: optional settings (server binary, readiness, shutdown)
//! - `lifecycle.events.jsonl`: audit trail
//! - `logs/<name>.log`: server stdout/stderr
//!
//! ## Operation Flow
//!
//! Snapshot under the lock, release it, act on the OS (spawn and wait for
//! readiness, or signal and wait for exit), then relock and commit the
//! record by name. The lock never spans a server's start-up or shutdown.
//!
//! # Examples
//!
//! ```bash
//! # Create an instance in /var/mongodb/data/reporting on port 27018
//! mongovisor create --name reporting --port 27018
//!
//! # Show ids and the PIDs seen in the process table
//! mongovisor list --live
//!
//! # Lifecycle by id
//! mongovisor stop 0
//! mongovisor restart 0
//! mongovisor delete 0
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: root layout, registry store, config, errors, logging, events
//! - [`plugins`]: process resolver, launcher, lifecycle manager, listing

pub mod cli;
pub mod core;
pub mod plugins;

use crate::cli::{Cli, Command, CreateCli, ListCli};
use crate::core::{
    config::{self, SupervisorConfig},
    error::VisorError,
    logging,
    output::compact_line,
    state::InstanceStore,
    store::Store,
};
use crate::plugins::{
    launcher::ProcessLauncher,
    lifecycle::{Action, CreateRequest, LifecycleManager, Outcome},
    listing::{self, ListFormat},
    resolver::{ProcessResolver, PsResolver},
};

use clap::Parser;
use colored::Colorize;

const MESSAGE_PREVIEW_CHARS: usize = 160;

pub fn run() -> Result<(), VisorError> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let home = Store::resolve(cli.root.as_deref())?;
    let config = config::load_config(&home.config_path())?;
    tracing::debug!(root = %home.root.display(), binary = %config.server.binary, "resolved supervisor root");

    match cli.command {
        Command::Create(create) => {
            let request = create_request(&create)?;
            let outcome = open_manager(&home, &config)?.create(&request)?;
            print_outcome(&outcome);
        }
        Command::Start { id } => print_outcome(&open_manager(&home, &config)?.start(id)?),
        Command::Stop { id } => print_outcome(&open_manager(&home, &config)?.stop(id)?),
        Command::Restart { id } => print_outcome(&open_manager(&home, &config)?.restart(id)?),
        Command::Delete { id } => print_outcome(&open_manager(&home, &config)?.delete(id)?),
        Command::List(list) => run_list(&home, &config, &list)?,
        Command::Reconcile => print_reconcile(&open_manager(&home, &config)?.reconcile()?),
    }
    Ok(())
}

fn open_manager(
    home: &Store,
    config: &SupervisorConfig,
) -> Result<LifecycleManager<PsResolver, ProcessLauncher>, VisorError> {
    home.ensure()?;
    Ok(LifecycleManager::open(home, config))
}

/// The instance directory is `<data-dir>/<name>`; the name must be a single path component.
fn create_request(create: &CreateCli) -> Result<CreateRequest, VisorError> {
    let name = create.name.trim();
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(VisorError::ValidationError(format!(
            "instance name '{}' cannot be used as a directory name",
            name
        )));
    }
    let data_directory = std::path::absolute(create.data_dir.join(name))?;
    Ok(CreateRequest {
        name: name.to_string(),
        data_directory,
        port: create.port,
    })
}

fn run_list(home: &Store, config: &SupervisorConfig, list: &ListCli) -> Result<(), VisorError> {
    let format: ListFormat = list.format.parse()?;
    let store = InstanceStore::new(home.instances_path(), home.lock_path());
    let resolver = PsResolver::new(&config.server.binary);
    let live = list.live.then_some(&resolver as &dyn ProcessResolver);
    let rows = listing::rows(&store, live)?;
    match format {
        ListFormat::Table => println!("{}", listing::render_table(&rows)),
        ListFormat::Json => println!("{}", listing::render_json(&rows)?),
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    let name = format!("'{}'", outcome.instance).bright_cyan();
    let pid = outcome
        .pid
        .map(|pid| format!(" (pid {})", pid))
        .unwrap_or_default();
    let port = outcome.port;
    match outcome.action {
        Action::Created => println!(
            "{} Created {} on port {}{}",
            "✓".bright_green(),
            name,
            port,
            pid
        ),
        Action::Started => println!(
            "{} Started {} on port {}{}",
            "✓".bright_green(),
            name,
            port,
            pid
        ),
        Action::Adopted => println!(
            "{} Adopted server already running for {} on port {}{}",
            "✓".bright_green(),
            name,
            port,
            pid
        ),
        Action::Restarted => println!(
            "{} Restarted {} on port {}{}",
            "✓".bright_green(),
            name,
            port,
            pid
        ),
        Action::Stopped => println!("{} Stopped {}{}", "✓".bright_green(), name, pid),
        Action::Deleted => println!(
            "{} Deleted {}{} (data directory kept)",
            "✓".bright_green(),
            name,
            pid
        ),
        Action::Reconciled => println!(
            "{} {} had no server process; marked {}",
            "⚠".bright_yellow(),
            name,
            outcome.status
        ),
        Action::AlreadyRunning => {
            println!("{} {} is already running", "▸".bright_cyan(), name)
        }
        Action::AlreadyStopped => {
            println!("{} {} is already stopped", "▸".bright_cyan(), name)
        }
    }
}

fn print_reconcile(changes: &[Outcome]) {
    if changes.is_empty() {
        println!(
            "{} All instances match the process table",
            "✓".bright_green()
        );
        return;
    }
    for change in changes {
        let pid = change
            .pid
            .map(|pid| format!(" (pid {})", pid))
            .unwrap_or_default();
        println!(
            "{} {} -> {}{}",
            "▸".bright_cyan(),
            compact_line(&change.instance, MESSAGE_PREVIEW_CHARS).bright_cyan(),
            change.status,
            pid
        );
    }
}
