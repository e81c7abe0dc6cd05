//! Configuration for one tracked tree.
//!
//! Stored at `.fixgate/config.json` next to the rest of the persisted state.
//! A missing file means defaults; a corrupt file is preserved with a
//! `.corrupt` suffix and replaced by defaults, loudly.

use crate::ops::OperationType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Regex patterns selecting which relative paths the fingerprint tracks.
    /// Empty means "track every file the walker visits".
    pub tracked_patterns: Vec<String>,
    /// Directory names the walker never descends into.
    pub ignore_dirs: Vec<String>,
    /// Per-operation command lines overriding project-type defaults.
    pub commands: HashMap<OperationType, String>,
    /// Minutes after which an otherwise-healthy operation is stale enough to
    /// re-run without a tree change.
    pub stale_after_minutes: u64,
    /// Seconds between daemon ticks.
    pub tick_interval_secs: u64,
    /// Hard ceiling on a single action invocation.
    pub action_timeout_secs: u64,
    /// Success rate below which a well-sampled operation is suppressed.
    pub low_success_threshold: f64,
    /// Attempts needed before the success rate is trusted at all.
    pub min_samples: u64,
    /// Daemon lock heartbeats older than this are reported as stale.
    pub lock_stale_after_secs: u64,
    /// Skip the buildable safety check (useful on trees with no toolchain).
    pub skip_build_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracked_patterns: Vec::new(),
            ignore_dirs: default_ignore_dirs(),
            commands: HashMap::new(),
            stale_after_minutes: 60,
            tick_interval_secs: 120,
            action_timeout_secs: 30,
            low_success_threshold: 0.70,
            min_samples: 3,
            lock_stale_after_secs: 600,
            skip_build_check: false,
        }
    }
}

fn default_ignore_dirs() -> Vec<String> {
    [
        "target",
        "node_modules",
        ".git",
        ".svn",
        ".hg",
        "dist",
        "build",
        "__pycache__",
        ".pytest_cache",
        "vendor",
        ".idea",
        ".vscode",
        ".fixgate",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Config {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(CONFIG_FILE)
    }

    /// Load from the state directory, or defaults when absent. Corruption
    /// recovers this structure alone: the bad file is kept for inspection.
    pub fn load(state_dir: &Path) -> Self {
        let path = Self::path(state_dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt(&path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupt; kept a .corrupt copy and loaded defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(state_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        crate::store::write_atomic(&Self::path(state_dir), &content)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_minutes as i64)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Compile tracked-path patterns, skipping (and reporting) invalid ones
    /// rather than refusing to fingerprint at all.
    pub fn compiled_patterns(&self) -> Vec<Regex> {
        self.tracked_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern, error = %err, "ignoring invalid tracked pattern");
                    None
                }
            })
            .collect()
    }
}

fn preserve_corrupt(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.stale_after_minutes, 60);
        assert_eq!(config.min_samples, 3);
        assert!((config.low_success_threshold - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tick_interval_secs = 5;
        config
            .commands
            .insert(OperationType::LintFix, "ruff check --fix .".to_string());
        config.save(tmp.path()).unwrap();

        let loaded = Config::load(tmp.path());
        assert_eq!(loaded.tick_interval_secs, 5);
        assert_eq!(
            loaded.commands.get(&OperationType::LintFix).unwrap(),
            "ruff check --fix ."
        );
    }

    #[test]
    fn corrupt_file_is_preserved_and_defaults_loaded() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "{not json").unwrap();
        let config = Config::load(tmp.path());
        assert_eq!(config.tick_interval_secs, 120);
        assert!(tmp.path().join("config.json.corrupt").exists());
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let mut config = Config::default();
        config.tracked_patterns = vec!["\\.rs$".to_string(), "(".to_string()];
        assert_eq!(config.compiled_patterns().len(), 1);
    }
}
