//! Instance lifecycle manager.
//!
//! Per-instance states: `stopped -> starting -> running -> stopping -> stopped`.
//! Only `stopped` and `running` are persisted; the transient phases exist
//! while an operation runs and show up in the lifecycle event log.
//!
//! Every operation follows the same shape:
//! 1. snapshot the collection under the state lock and validate the id,
//! 2. release the lock and act on the OS (spawn + readiness, or signal + wait),
//! 3. re-acquire the lock, re-locate the record by its unique name, write.
//!
//! The lock guards the record, never the server's start-up or shutdown time.
//! From spawn until the record is committed an [`InterruptGuard`] is held, so
//! an interrupted `create` or `start` kills its server instead of orphaning it.

use crate::core::config::SupervisorConfig;
use crate::core::error::{SignalError, VisorError};
use crate::core::events::EventLog;
use crate::core::state::{
    InstanceRecord, InstanceStatus, InstanceStore, check_id, position_by_name,
};
use crate::core::store::Store;
use crate::plugins::interrupt::{self, InterruptGuard};
use crate::plugins::launcher::{LaunchSpec, ProcessLauncher, ServerLauncher};
use crate::plugins::resolver::{ProcessId, ProcessResolver, PsResolver};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const WRITE_PROBE_FILE: &str = ".mongovisor-write-probe";

/// Parameters for `create`, already collected by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub data_directory: PathBuf,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Started,
    /// A live server for the port already existed and was taken over.
    Adopted,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
    /// Recorded status corrected to match the process table.
    Reconciled,
    Restarted,
    Deleted,
}

impl Action {
    pub fn is_noop(self) -> bool {
        matches!(self, Action::AlreadyRunning | Action::AlreadyStopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub instance: String,
    pub port: u16,
    pub action: Action,
    pub status: InstanceStatus,
    pub pid: Option<ProcessId>,
}

impl Outcome {
    fn new(rec: &InstanceRecord, action: Action, status: InstanceStatus, pid: Option<u32>) -> Self {
        Self {
            instance: rec.name.clone(),
            port: rec.port,
            action,
            status,
            pid,
        }
    }
}

/// How long to wait for a server to exit, and what to do when it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub timeout: Duration,
    pub force_kill: bool,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
}

impl ShutdownPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            timeout: config.stop_timeout(),
            force_kill: config.shutdown.force_kill,
            kill_grace: config.kill_grace(),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

pub struct LifecycleManager<R, L> {
    home: Store,
    store: InstanceStore,
    events: EventLog,
    resolver: R,
    launcher: L,
    shutdown: ShutdownPolicy,
}

impl LifecycleManager<PsResolver, ProcessLauncher> {
    /// Manager wired to the real process table and server binary.
    pub fn open(home: &Store, config: &SupervisorConfig) -> Self {
        LifecycleManager::new(
            home,
            PsResolver::new(&config.server.binary),
            ProcessLauncher::from_config(config),
        )
        .with_shutdown(ShutdownPolicy::from_config(config))
        .with_lock_timeout(config.lock_timeout())
    }
}

impl<R: ProcessResolver, L: ServerLauncher> LifecycleManager<R, L> {
    pub fn new(home: &Store, resolver: R, launcher: L) -> Self {
        Self {
            home: home.clone(),
            store: InstanceStore::new(home.instances_path(), home.lock_path()),
            events: EventLog::new(home.events_path()),
            resolver,
            launcher,
            shutdown: ShutdownPolicy::default(),
        }
    }

    pub fn with_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.store = self.store.with_lock_timeout(timeout);
        self
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Spawn a new server and record it once it is ready. Nothing is persisted on failure.
    pub fn create(&self, req: &CreateRequest) -> Result<Outcome, VisorError> {
        let name = req.name.trim().to_string();
        validate_name(&name)?;
        validate_port(req.port)?;

        self.events
            .note("create", Some(&name), Some(req.port), "pending", None, Some("starting"));
        let result = self.create_inner(&name, req);
        self.finish("create", &name, req.port, &result);
        result
    }

    fn create_inner(&self, name: &str, req: &CreateRequest) -> Result<Outcome, VisorError> {
        let records = self.store.snapshot()?;
        ensure_unique_name(&records, name)?;
        ensure_port_unclaimed(&records, req.port, name)?;

        prepare_data_directory(name, &req.data_directory, true)?;
        if let Some(pid) = self.resolver.find_process(req.port)? {
            return Err(VisorError::ValidationError(format!(
                "port {} is already served by pid {} which no instance owns",
                req.port, pid
            )));
        }

        let record = InstanceRecord {
            name: name.to_string(),
            data_directory: req.data_directory.clone(),
            port: req.port,
            status: InstanceStatus::Running,
        };
        let _interrupts = InterruptGuard::install()?;
        let launched = self.launcher.launch(&self.launch_spec(&record))?;

        let committed = self.store.transact(|records| {
            ensure_unique_name(records, name)?;
            ensure_port_unclaimed(records, record.port, name)?;
            records.push(record.clone());
            Ok(())
        });
        if let Err(e) = committed {
            self.discard_untracked(name, launched.pid);
            return Err(e);
        }
        interrupt::untrack(launched.pid);

        tracing::info!(instance = name, pid = launched.pid, port = req.port, "instance created");
        Ok(Outcome::new(
            &record,
            Action::Created,
            InstanceStatus::Running,
            Some(launched.pid),
        ))
    }

    /// Start a stopped instance; a running one is left alone.
    pub fn start(&self, id: usize) -> Result<Outcome, VisorError> {
        let (records, rec) = self.resolve_id(id)?;
        self.events
            .note("start", Some(&rec.name), Some(rec.port), "pending", None, Some("starting"));
        let result = if rec.is_running() {
            Ok(Outcome::new(&rec, Action::AlreadyRunning, InstanceStatus::Running, None))
        } else {
            self.start_record(&records, &rec)
        };
        self.finish("start", &rec.name, rec.port, &result);
        result
    }

    /// Stop a running instance; the record ends `stopped` unless the server is verifiably alive.
    pub fn stop(&self, id: usize) -> Result<Outcome, VisorError> {
        let (_, rec) = self.resolve_id(id)?;
        self.events
            .note("stop", Some(&rec.name), Some(rec.port), "pending", None, Some("stopping"));
        let result = if rec.is_running() {
            self.stop_record(&rec)
        } else {
            Ok(Outcome::new(&rec, Action::AlreadyStopped, InstanceStatus::Stopped, None))
        };
        self.finish("stop", &rec.name, rec.port, &result);
        result
    }

    /// Stop (with confirmed exit) then start. A failed stop aborts the restart.
    pub fn restart(&self, id: usize) -> Result<Outcome, VisorError> {
        let (_, rec) = self.resolve_id(id)?;
        self.events
            .note("restart", Some(&rec.name), Some(rec.port), "pending", None, None);
        let result = self.restart_record(&rec);
        self.finish("restart", &rec.name, rec.port, &result);
        result
    }

    fn restart_record(&self, rec: &InstanceRecord) -> Result<Outcome, VisorError> {
        if rec.is_running() {
            self.stop_record(rec)?;
        }
        let records = self.store.snapshot()?;
        let pos = position_by_name(&records, &rec.name)?;
        let fresh = records[pos].clone();
        if fresh.is_running() {
            return Ok(Outcome::new(&fresh, Action::AlreadyRunning, InstanceStatus::Running, None));
        }
        let started = self.start_record(&records, &fresh)?;
        if started.action == Action::Adopted {
            return Ok(started);
        }
        Ok(Outcome {
            action: Action::Restarted,
            ..started
        })
    }

    /// Remove an instance, stopping it first when it is running. Data is left on disk.
    pub fn delete(&self, id: usize) -> Result<Outcome, VisorError> {
        let (_, rec) = self.resolve_id(id)?;
        self.events
            .note("delete", Some(&rec.name), Some(rec.port), "pending", None, None);
        let result = self.delete_record(&rec);
        self.finish("delete", &rec.name, rec.port, &result);
        result
    }

    fn delete_record(&self, rec: &InstanceRecord) -> Result<Outcome, VisorError> {
        let pid = if rec.is_running() {
            self.stop_record(rec)?.pid
        } else {
            None
        };
        self.store.transact(|records| {
            let pos = position_by_name(records, &rec.name)?;
            records.remove(pos);
            Ok(())
        })?;
        tracing::info!(instance = %rec.name, "instance deleted");
        Ok(Outcome::new(rec, Action::Deleted, InstanceStatus::Stopped, pid))
    }

    /// Re-derive every record's status from the process table and persist corrections.
    pub fn reconcile(&self) -> Result<Vec<Outcome>, VisorError> {
        self.events.note("reconcile", None, None, "pending", None, None);
        let result = self.reconcile_all();
        match &result {
            Ok(changes) if changes.is_empty() => {
                self.events.note("reconcile", None, None, "noop", None, None)
            }
            Ok(changes) => self.events.note(
                "reconcile",
                None,
                None,
                "success",
                None,
                Some(&format!("{} record(s) corrected", changes.len())),
            ),
            Err(e) => self.events.note(
                "reconcile",
                None,
                None,
                "error",
                None,
                Some(&e.to_string()),
            ),
        }
        result
    }

    fn reconcile_all(&self) -> Result<Vec<Outcome>, VisorError> {
        let snapshot = self.store.snapshot()?;
        let mut observed = Vec::with_capacity(snapshot.len());
        for rec in &snapshot {
            observed.push((rec.name.clone(), self.resolver.find_process(rec.port)?));
        }

        let changes = self.store.transact(|records| {
            let mut changes = Vec::new();
            let mut claimed = BTreeSet::new();

            // Running records backed by a live server keep their port first.
            for (name, pid) in &observed {
                let Ok(pos) = position_by_name(records, name) else {
                    continue;
                };
                let rec = &mut records[pos];
                if rec.is_running() {
                    if pid.is_some() {
                        claimed.insert(rec.port);
                    } else {
                        rec.status = InstanceStatus::Stopped;
                        changes.push(Outcome::new(rec, Action::Reconciled, rec.status, None));
                    }
                }
            }
            for (name, pid) in &observed {
                let Ok(pos) = position_by_name(records, name) else {
                    continue;
                };
                let rec = &mut records[pos];
                if let Some(pid) = pid {
                    if !rec.is_running() && claimed.insert(rec.port) {
                        rec.status = InstanceStatus::Running;
                        changes.push(Outcome::new(rec, Action::Reconciled, rec.status, Some(*pid)));
                    }
                }
            }
            Ok(changes)
        })?;

        for change in &changes {
            tracing::info!(
                instance = %change.instance,
                port = change.port,
                status = %change.status,
                "reconciled recorded status"
            );
        }
        Ok(changes)
    }

    fn resolve_id(&self, id: usize) -> Result<(Vec<InstanceRecord>, InstanceRecord), VisorError> {
        let records = self.store.snapshot()?;
        check_id(&records, id)?;
        let rec = records[id].clone();
        Ok((records, rec))
    }

    fn start_record(
        &self,
        records: &[InstanceRecord],
        rec: &InstanceRecord,
    ) -> Result<Outcome, VisorError> {
        ensure_port_unclaimed(records, rec.port, &rec.name)?;
        prepare_data_directory(&rec.name, &rec.data_directory, false)?;

        // Left over from an interrupted invocation: take it over instead of spawning twice.
        if let Some(pid) = self.resolver.find_process(rec.port)? {
            self.commit_status(&rec.name, InstanceStatus::Running)?;
            tracing::info!(instance = %rec.name, pid, "adopted running server");
            return Ok(Outcome::new(rec, Action::Adopted, InstanceStatus::Running, Some(pid)));
        }

        let _interrupts = InterruptGuard::install()?;
        let launched = self.launcher.launch(&self.launch_spec(rec))?;
        let committed = self.store.transact(|records| {
            ensure_port_unclaimed(records, rec.port, &rec.name)?;
            let pos = position_by_name(records, &rec.name)?;
            records[pos].status = InstanceStatus::Running;
            Ok(())
        });
        if let Err(e) = committed {
            self.discard_untracked(&rec.name, launched.pid);
            return Err(e);
        }
        interrupt::untrack(launched.pid);

        tracing::info!(
            instance = %rec.name,
            pid = launched.pid,
            ready_ms = launched.ready_after.as_millis() as u64,
            "instance started"
        );
        Ok(Outcome::new(
            rec,
            Action::Started,
            InstanceStatus::Running,
            Some(launched.pid),
        ))
    }

    fn stop_record(&self, rec: &InstanceRecord) -> Result<Outcome, VisorError> {
        let Some(pid) = self.resolver.find_process(rec.port)? else {
            self.commit_status(&rec.name, InstanceStatus::Stopped)?;
            tracing::warn!(instance = %rec.name, port = rec.port, "no server process found; marked stopped");
            return Ok(Outcome::new(rec, Action::Reconciled, InstanceStatus::Stopped, None));
        };

        self.terminate(&rec.name, pid)?;
        self.commit_status(&rec.name, InstanceStatus::Stopped)?;
        tracing::info!(instance = %rec.name, pid, "instance stopped");
        Ok(Outcome::new(rec, Action::Stopped, InstanceStatus::Stopped, Some(pid)))
    }

    /// SIGTERM, wait for exit, optionally escalate to SIGKILL. Ok means the pid is gone.
    fn terminate(&self, instance: &str, pid: ProcessId) -> Result<(), VisorError> {
        let start = Instant::now();
        match self.resolver.signal_terminate(pid) {
            Ok(()) => {}
            Err(SignalError::ProcessGone) => return Ok(()),
            Err(source) => {
                return Err(VisorError::Signal {
                    instance: instance.to_string(),
                    pid,
                    source,
                });
            }
        }
        if self.wait_for_exit(pid, self.shutdown.timeout)? {
            return Ok(());
        }

        if self.shutdown.force_kill {
            tracing::warn!(instance, pid, "graceful shutdown timed out; sending SIGKILL");
            match self.resolver.force_kill(pid) {
                Ok(()) => {}
                Err(SignalError::ProcessGone) => return Ok(()),
                Err(source) => {
                    return Err(VisorError::Signal {
                        instance: instance.to_string(),
                        pid,
                        source,
                    });
                }
            }
            if self.wait_for_exit(pid, self.shutdown.kill_grace)? {
                return Ok(());
            }
        }

        Err(VisorError::ShutdownTimeout {
            instance: instance.to_string(),
            pid,
            waited_ms: start.elapsed().as_millis(),
        })
    }

    fn wait_for_exit(&self, pid: ProcessId, timeout: Duration) -> Result<bool, VisorError> {
        let start = Instant::now();
        loop {
            if !self.resolver.is_running(pid)? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            thread::sleep(self.shutdown.poll_interval);
        }
    }

    fn commit_status(&self, name: &str, status: InstanceStatus) -> Result<(), VisorError> {
        self.store.transact(|records| {
            let pos = position_by_name(records, name)?;
            records[pos].status = status;
            Ok(())
        })
    }

    /// A server came up but its record could not be written; do not leave it orphaned.
    fn discard_untracked(&self, instance: &str, pid: ProcessId) {
        tracing::warn!(instance, pid, "terminating server whose record could not be committed");
        if let Err(e) = self.terminate(instance, pid) {
            tracing::error!(instance, pid, error = %e, "failed to terminate untracked server");
        }
        interrupt::untrack(pid);
    }

    fn launch_spec(&self, rec: &InstanceRecord) -> LaunchSpec {
        LaunchSpec {
            instance: rec.name.clone(),
            data_directory: rec.data_directory.clone(),
            port: rec.port,
            log_path: self.home.server_log_path(&rec.name),
        }
    }

    fn finish(&self, op: &str, name: &str, port: u16, result: &Result<Outcome, VisorError>) {
        match result {
            Ok(outcome) => {
                let status = if outcome.action.is_noop() { "noop" } else { "success" };
                let detail = serde_json::to_value(outcome.action)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string));
                self.events
                    .note(op, Some(name), Some(port), status, outcome.pid, detail.as_deref());
            }
            Err(e) => {
                self.events
                    .note(op, Some(name), Some(port), "error", None, Some(&e.to_string()));
            }
        }
    }
}

fn validate_name(name: &str) -> Result<(), VisorError> {
    if name.is_empty() {
        return Err(VisorError::ValidationError(
            "instance name cannot be empty".to_string(),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(VisorError::ValidationError(format!(
            "instance name {:?} contains control characters",
            name
        )));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<(), VisorError> {
    if port == 0 {
        return Err(VisorError::ValidationError(
            "port must be in 1..=65535".to_string(),
        ));
    }
    Ok(())
}

fn ensure_unique_name(records: &[InstanceRecord], name: &str) -> Result<(), VisorError> {
    if records.iter().any(|r| r.name == name) {
        return Err(VisorError::ValidationError(format!(
            "an instance named '{}' already exists",
            name
        )));
    }
    Ok(())
}

/// No running record other than `name` may hold `port`.
fn ensure_port_unclaimed(
    records: &[InstanceRecord],
    port: u16,
    name: &str,
) -> Result<(), VisorError> {
    let holder = records
        .iter()
        .find(|r| r.is_running() && r.port == port && r.name != name);
    match holder {
        Some(r) => Err(VisorError::ValidationError(format!(
            "cannot run '{}': port {} is already used by running instance '{}'",
            name, port, r.name
        ))),
        None => Ok(()),
    }
}

/// Ensure the data directory exists (creating it when asked) and is writable.
fn prepare_data_directory(instance: &str, dir: &Path, create: bool) -> Result<(), VisorError> {
    let unusable = |reason: String| VisorError::DataDirectory {
        instance: instance.to_string(),
        path: dir.to_path_buf(),
        reason,
    };
    if create {
        fs::create_dir_all(dir).map_err(|e| unusable(format!("cannot be created: {}", e)))?;
    }
    if !dir.is_dir() {
        return Err(unusable("does not exist".to_string()));
    }
    let probe = dir.join(WRITE_PROBE_FILE);
    fs::write(&probe, b"").map_err(|e| unusable(format!("is not writable: {}", e)))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}
