//! The long-running scheduler: one locked loop ticking over the tree.
//!
//! Exactly one daemon runs per tracked tree, enforced with an advisory lock
//! on `.fixgate/daemon.lock`. The lock file carries a small JSON record
//! (owner, pid, heartbeat) for observability; the lock itself is what keeps
//! a second instance out, and the kernel releases it if the holder dies, so
//! a crashed daemon never wedges the tree.
//!
//! Each tick runs one cycle restricted to the next category in a fixed
//! round-robin, renews the heartbeat, and publishes a status file for
//! `fixgate daemon status` to read without taking any lock.

use crate::action::ActionSet;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::ops::Category;
use crate::project::{self, ProjectType};
use crate::safety::SafetyGate;
use crate::store::{
    self, StateStore, DAEMON_LOCK_FILE, DAEMON_STATUS_FILE, DAEMON_STOP_FILE,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How finely the inter-tick sleep is sliced so a stop request is noticed
/// promptly.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Identity and liveness of the lock holder. Informational; the advisory
/// lock is the actual mutual exclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Held for the daemon's whole lifetime. Dropping it releases the lock.
pub struct DaemonLock {
    file: File,
    record: LockRecord,
}

/// Outcome of trying to become the daemon for a tree.
pub enum LockAttempt {
    Acquired(DaemonLock),
    /// Another live instance holds the lock. Its last known record, when
    /// readable.
    Held(Option<LockRecord>),
}

impl DaemonLock {
    /// Try to take the daemon lock without blocking.
    pub fn acquire(state_dir: &Path) -> Result<LockAttempt> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(DAEMON_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(LockAttempt::Held(read_record(&path)));
            }
            Err(err) => return Err(err.into()),
        }

        // We hold the lock. A leftover record here means the previous owner
        // died without cleanup; the kernel already released its lock.
        if let Some(stale) = read_record(&path) {
            info!(
                previous_pid = stale.pid,
                last_heartbeat = %stale.heartbeat_at,
                "reclaimed daemon lock from a dead instance"
            );
        }

        let now = Utc::now();
        let record = LockRecord {
            owner_id: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        };
        let mut lock = DaemonLock { file, record };
        lock.write_record()?;
        Ok(LockAttempt::Acquired(lock))
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Refresh the heartbeat timestamp in the lock record.
    pub fn heartbeat(&mut self) -> Result<()> {
        self.record.heartbeat_at = Utc::now();
        self.write_record()
    }

    fn write_record(&mut self) -> Result<()> {
        let content = serde_json::to_string(&self.record)?;
        self.file.set_len(0)?;
        self.file.rewind()?;
        self.file.write_all(content.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // Leave the record in place; the released lock is what signals "not
        // running" to the next acquirer.
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(content.trim()).ok()
}

/// Snapshot of the daemon published once per tick. Read-only for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub owner_id: Uuid,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: DaemonPhase,
    pub last_category: Option<Category>,
    pub cycles_completed: u64,
    pub ops_run: u64,
    pub ops_skipped: u64,
    pub vetoes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonPhase {
    Running,
    Sleeping,
    Stopped,
}

/// Fixed rotation over categories, one per tick.
struct Rotation {
    next: usize,
}

impl Rotation {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn advance(&mut self) -> Category {
        let categories = Category::all();
        let category = categories[self.next % categories.len()];
        self.next += 1;
        category
    }
}

pub struct Daemon {
    root: PathBuf,
    store: StateStore,
    config: Config,
    project: ProjectType,
    status: DaemonStatus,
    rotation: Rotation,
}

/// Why `Daemon::run` returned.
#[derive(Debug, PartialEq, Eq)]
pub enum DaemonExit {
    /// A stop request was honored.
    Stopped,
    /// Another instance already holds the lock; nothing was touched.
    AlreadyRunning,
}

impl Daemon {
    /// Run the scheduler loop for `root` until a stop is requested. Returns
    /// without error when another instance already holds the lock.
    pub fn run(root: &Path) -> Result<DaemonExit> {
        let store = StateStore::new(root);
        store.init()?;
        let config = Config::load(store.state_dir());

        let mut lock = match DaemonLock::acquire(store.state_dir())? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::Held(record) => {
                match record {
                    Some(record) => info!(
                        pid = record.pid,
                        since = %record.acquired_at,
                        "daemon already running for this tree"
                    ),
                    None => info!("daemon already running for this tree"),
                }
                return Ok(DaemonExit::AlreadyRunning);
            }
        };

        // A stop request from a previous life must not kill this one.
        let stop_path = store.state_dir().join(DAEMON_STOP_FILE);
        let _ = fs::remove_file(&stop_path);

        let project = project::detect_project_type(root);
        let now = Utc::now();
        let mut daemon = Daemon {
            root: root.to_path_buf(),
            status: DaemonStatus {
                owner_id: lock.record().owner_id,
                pid: lock.record().pid,
                started_at: now,
                updated_at: now,
                phase: DaemonPhase::Running,
                last_category: None,
                cycles_completed: 0,
                ops_run: 0,
                ops_skipped: 0,
                vetoes: 0,
            },
            rotation: Rotation::new(),
            store,
            config,
            project,
        };
        info!(
            root = %root.display(),
            project = daemon.project.name(),
            tick_secs = daemon.config.tick_interval_secs,
            "daemon started"
        );

        loop {
            if stop_requested(&stop_path) {
                break;
            }

            daemon.tick(&mut lock)?;

            if daemon.sleep_until_next_tick(&stop_path) {
                break;
            }
        }

        let _ = fs::remove_file(&stop_path);
        daemon.status.phase = DaemonPhase::Stopped;
        daemon.publish_status()?;
        info!(
            cycles = daemon.status.cycles_completed,
            "daemon stopped on request"
        );
        Ok(DaemonExit::Stopped)
    }

    /// One tick: run a cycle for the next category, fold its counts into the
    /// cumulative status, renew the heartbeat, publish.
    fn tick(&mut self, lock: &mut DaemonLock) -> Result<()> {
        let category = self.rotation.advance();
        self.status.phase = DaemonPhase::Running;
        self.status.last_category = Some(category);

        let gate = SafetyGate::builtin(self.project, &self.config);
        let actions = ActionSet::for_project(
            self.project,
            &self.config.commands,
            self.config.action_timeout(),
        );
        let coordinator =
            Coordinator::new(&self.root, &self.config, &self.store, gate, actions);

        match coordinator.run_cycle(Some(category)) {
            Ok(report) => {
                self.status.cycles_completed += 1;
                if report.vetoed() {
                    self.status.vetoes += 1;
                } else {
                    self.status.ops_run += report.ran_count() as u64;
                    self.status.ops_skipped += report.skipped_count() as u64;
                }
            }
            // One bad cycle must not bring the scheduler down.
            Err(err) => warn!(category = category.key(), error = %err, "cycle failed"),
        }

        lock.heartbeat()?;
        self.status.phase = DaemonPhase::Sleeping;
        self.publish_status()
    }

    /// Sleep in slices, watching for a stop request. Returns true when one
    /// arrived.
    fn sleep_until_next_tick(&self, stop_path: &Path) -> bool {
        let mut remaining = self.config.tick_interval();
        while remaining > Duration::ZERO {
            if stop_requested(stop_path) {
                return true;
            }
            let slice = remaining.min(STOP_POLL_INTERVAL);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        stop_requested(stop_path)
    }

    fn publish_status(&mut self) -> Result<()> {
        self.status.updated_at = Utc::now();
        let path = self.store.state_dir().join(DAEMON_STATUS_FILE);
        let content = serde_json::to_string_pretty(&self.status)?;
        store::write_atomic(&path, &content)
    }
}

fn stop_requested(stop_path: &Path) -> bool {
    stop_path.exists()
}

/// Ask a running daemon to wind down after its current cycle.
pub fn request_stop(root: &Path) -> Result<()> {
    let store = StateStore::new(root);
    if !store.state_dir().exists() {
        anyhow::bail!("no state directory at {}", store.state_dir().display());
    }
    let stop_path = store.state_dir().join(DAEMON_STOP_FILE);
    fs::write(&stop_path, "stop\n").context("failed to write stop request")?;
    Ok(())
}

/// What an observer can learn about the daemon without holding any lock.
#[derive(Debug)]
pub struct DaemonObservation {
    pub running: bool,
    pub lock_record: Option<LockRecord>,
    pub status: Option<DaemonStatus>,
    /// Heartbeat older than the configured staleness bound while the lock is
    /// still held; the holder is alive but wedged.
    pub heartbeat_stale: bool,
}

/// Inspect the daemon's lock and status files.
pub fn observe(root: &Path, config: &Config) -> DaemonObservation {
    let store = StateStore::new(root);
    let lock_path = store.state_dir().join(DAEMON_LOCK_FILE);
    let status_path = store.state_dir().join(DAEMON_STATUS_FILE);

    let lock_record = read_record(&lock_path);
    let status = fs::read_to_string(&status_path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok());

    // The lock is held iff a non-blocking probe fails.
    let running = match OpenOptions::new().read(true).write(true).open(&lock_path) {
        Ok(file) => match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        },
        Err(_) => false,
    };

    let heartbeat_stale = running
        && lock_record.as_ref().is_some_and(|record| {
            let age = Utc::now().signed_duration_since(record.heartbeat_at);
            age > chrono::Duration::seconds(config.lock_stale_after_secs as i64)
        });

    DaemonObservation {
        running,
        lock_record,
        status,
        heartbeat_stale,
    }
}
