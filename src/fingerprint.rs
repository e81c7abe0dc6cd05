//! Drift detection for the tracked tree.
//!
//! One digest summarizes the whole file set: a manifest of
//! `(relative path, size, mtime)` plus file contents, sorted by path and
//! streamed through a single FNV-1a hasher. Sorting makes the result
//! independent of filesystem traversal order; streaming avoids invoking a
//! hash tool per file.

use crate::config::Config;
use crate::util::StreamingHash;
use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Above this size a file contributes only its metadata to the digest.
/// Size + mtime still catch edits; we just skip reading huge blobs.
const MAX_CONTENT_BYTES: u64 = 4 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// The fingerprint of the tree as of the last accepted cycle.
/// Replaced wholesale; never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub fingerprint: String,
    pub computed_at: DateTime<Utc>,
}

impl SourceSnapshot {
    pub fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            computed_at: Utc::now(),
        }
    }
}

pub struct ChangeDetector {
    root: PathBuf,
    ignore_dirs: Vec<String>,
    patterns: Vec<Regex>,
}

impl ChangeDetector {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            ignore_dirs: config.ignore_dirs.clone(),
            patterns: config.compiled_patterns(),
        }
    }

    /// Compute the digest for the current tree state. Read-only: never
    /// persists anything. An empty matching set produces the stable
    /// empty-manifest digest rather than an error.
    pub fn compute_fingerprint(&self) -> Result<String> {
        let mut manifest: Vec<(String, u64, u64)> = Vec::new();

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_ignored(e.path()))
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let rel = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if !self.patterns.is_empty() && !self.patterns.iter().any(|re| re.is_match(&rel_str)) {
                continue;
            }

            let metadata = match fs::metadata(path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            manifest.push((rel_str, metadata.len(), mtime));
        }

        // Path order, not traversal order, defines the digest.
        manifest.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = StreamingHash::new();
        for (rel, size, mtime) in &manifest {
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
            hasher.update_u64(*size);
            hasher.update_u64(*mtime);
            if *size <= MAX_CONTENT_BYTES {
                // A file deleted between the walk and here just contributes
                // its metadata, same as an oversized one.
                let _ = hash_file_content(&self.root.join(rel), &mut hasher);
            }
        }
        Ok(hasher.digest())
    }

    /// Compare the current tree against a stored snapshot. A missing
    /// snapshot counts as drift: nothing has ever been accepted.
    pub fn has_changed(&self, stored: Option<&SourceSnapshot>) -> Result<bool> {
        let current = self.compute_fingerprint()?;
        Ok(match stored {
            Some(snapshot) => snapshot.fingerprint != current,
            None => true,
        })
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        name.starts_with('.') || self.ignore_dirs.iter().any(|d| d == name)
    }
}

fn hash_file_content(path: &Path, hasher: &mut StreamingHash) -> Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}
