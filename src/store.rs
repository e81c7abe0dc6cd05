//! Persisted state for one tracked tree, under `.fixgate/`.
//!
//! Three independent structures live here: the outcome ledger, the current
//! source snapshot, and the daemon lock/status pair. Each tolerates first-run
//! absence, and each recovers from corruption alone: a mangled ledger never
//! takes the snapshot down with it.
//!
//! Writes go through write-then-atomic-replace so a crash mid-write leaves
//! the previous valid file in place. Cross-process access is serialized with
//! an advisory fs2 lock; readers take it shared, writers exclusive.

use crate::fingerprint::SourceSnapshot;
use crate::ledger::Ledger;
use anyhow::Result;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

pub const STATE_DIR: &str = ".fixgate";
pub const LEDGER_FILE: &str = "ledger.json";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const DAEMON_LOCK_FILE: &str = "daemon.lock";
pub const DAEMON_STATUS_FILE: &str = "daemon.status.json";
pub const DAEMON_STOP_FILE: &str = "daemon.stop";

const STORE_LOCK_FILE: &str = ".lock";
const STORE_LOCK_TIMEOUT_SECS: u64 = 5;
const STORE_LOCK_RETRY_MS: u64 = 50;

pub struct StateStore {
    state_dir: PathBuf,
}

struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            state_dir: repo_root.join(STATE_DIR),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Create the state directory and register it with the repo's ignore
    /// machinery so the gate never fingerprints its own state.
    pub fn init(&self) -> Result<()> {
        self.ensure_dir()
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir)?;
        }
        self.ensure_state_ignored()?;
        Ok(())
    }

    fn ensure_state_ignored(&self) -> Result<()> {
        let Some(repo_root) = self.state_dir.parent() else {
            return Ok(());
        };

        let gitignore_path = repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, ".fixgate/");
        }

        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let info_exclude = git_dir.join("info").join("exclude");
            if let Some(parent) = info_exclude.parent() {
                if fs::create_dir_all(parent).is_ok()
                    && append_ignore_entry(&info_exclude, ".fixgate/").is_ok()
                {
                    return Ok(());
                }
            }
        }

        append_ignore_entry(&gitignore_path, ".fixgate/")
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock> {
        if exclusive {
            self.ensure_dir()?;
        } else if !self.state_dir.exists() {
            return Err(anyhow::anyhow!("state directory missing"));
        }

        let lock_path = self.state_dir.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "timed out waiting for state lock ({}s)",
                            STORE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    /// Load the ledger; absence or corruption both yield an empty ledger,
    /// corruption loudly and with the bad file preserved.
    pub fn load_ledger(&self) -> Ledger {
        let path = self.state_dir.join(LEDGER_FILE);
        if !path.exists() {
            return Ledger::default();
        }
        let _lock = match self.lock(false) {
            Ok(lock) => lock,
            Err(_) => return Ledger::default(),
        };
        load_or_reinit(&path).unwrap_or_default()
    }

    pub fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        let _lock = self.lock(true)?;
        let path = self.state_dir.join(LEDGER_FILE);
        let content = serde_json::to_string(ledger)?;
        write_atomic(&path, &content)
    }

    pub fn load_snapshot(&self) -> Option<SourceSnapshot> {
        let path = self.state_dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return None;
        }
        let _lock = self.lock(false).ok()?;
        load_or_reinit(&path)
    }

    pub fn save_snapshot(&self, snapshot: &SourceSnapshot) -> Result<()> {
        let _lock = self.lock(true)?;
        let path = self.state_dir.join(SNAPSHOT_FILE);
        let content = serde_json::to_string(snapshot)?;
        write_atomic(&path, &content)
    }

    /// The safety gate's one bounded repair: sweep temp files orphaned by an
    /// interrupted atomic write. Returns how many were removed.
    pub fn sweep_orphaned_tmp(&self) -> Result<usize> {
        if !self.state_dir.exists() {
            return Ok(0);
        }
        let _lock = self.lock(true)?;
        let mut removed = 0;
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Parse a persisted structure; on corruption, keep the bad bytes under a
/// `.corrupt` suffix, warn, and report absence so the caller reinitializes
/// just this structure.
fn load_or_reinit<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            let corrupt_path = path.with_extension("json.corrupt");
            if fs::rename(path, &corrupt_path).is_err() {
                let _ = fs::write(&corrupt_path, &content);
                let _ = fs::remove_file(path);
            }
            warn!(
                path = %path.display(),
                error = %err,
                "persisted state was unreadable; preserved it and reinitialized empty"
            );
            None
        }
    }
}

/// Write content to a temp file, then rename over the destination.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&tmp_path, perms);
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

fn append_ignore_entry(path: &Path, entry: &str) -> Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == ".fixgate"
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    use std::io::Write;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# fixgate state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RunRecord;
    use crate::ops::OperationType;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(op: OperationType, success: bool) -> RunRecord {
        RunRecord {
            operation: op,
            timestamp: Utc::now(),
            success,
            items_affected: 1,
            note: None,
        }
    }

    #[test]
    fn ledger_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());

        let mut ledger = Ledger::default();
        ledger.append(record(OperationType::LintFix, true));
        store.save_ledger(&ledger).unwrap();

        let loaded = store.load_ledger();
        let stats = loaded.stats(OperationType::LintFix);
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[test]
    fn corrupt_ledger_reinitializes_and_preserves_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().unwrap();
        fs::write(store.state_dir().join(LEDGER_FILE), "{{{garbage").unwrap();

        let loaded = store.load_ledger();
        assert_eq!(loaded.stats(OperationType::LintFix).total_attempts, 0);
        assert!(store.state_dir().join("ledger.json.corrupt").exists());
    }

    #[test]
    fn corrupt_snapshot_does_not_touch_ledger() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());

        let mut ledger = Ledger::default();
        ledger.append(record(OperationType::FormatFix, false));
        store.save_ledger(&ledger).unwrap();
        fs::write(store.state_dir().join(SNAPSHOT_FILE), "not json").unwrap();

        assert!(store.load_snapshot().is_none());
        assert_eq!(
            store.load_ledger().stats(OperationType::FormatFix).total_attempts,
            1
        );
    }

    #[test]
    fn sweep_removes_only_tmp_files() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        store.init().unwrap();
        fs::write(store.state_dir().join("ledger.tmp"), "x").unwrap();
        fs::write(store.state_dir().join("keep.json"), "{}").unwrap();

        assert_eq!(store.sweep_orphaned_tmp().unwrap(), 1);
        assert!(store.state_dir().join("keep.json").exists());
    }

    #[test]
    fn gitignore_gains_state_entry_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), "target/\n").unwrap();
        let store = StateStore::new(tmp.path());
        store.init().unwrap();
        store.init().unwrap();

        let content = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches(".fixgate/").count(), 1);
    }
}
