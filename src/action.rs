//! Command-backed fix actions.
//!
//! The only action implementation the crate ships runs an external command
//! under a bounded timeout. A fix that hangs is killed and recorded as a
//! failure, never left in flight.
//!
//! Commands can report how much they touched by printing a line of the form
//! `items-affected: N`; without one the count defaults to zero and the tail
//! of the output becomes the note.

use crate::ops::{ActionOutcome, FixAction, OperationType};
use crate::project::{self, ProjectType};
use crate::util::truncate;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const OUTPUT_TAIL_CHARS: usize = 400;
const POLL_INTERVAL_MS: u64 = 50;

/// Raw result of one bounded command run.
#[derive(Debug)]
pub struct CommandRun {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandRun {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn a command, poll for completion, and kill it at the deadline.
pub fn run_with_timeout(program: &str, args: &[String], cwd: &Path, timeout: Duration) -> Result<CommandRun> {
    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;

    // Drain pipes on their own threads so a chatty command cannot deadlock
    // against a full pipe buffer while we poll.
    let stdout = child.stdout.take().context("failed to capture stdout")?;
    let stderr = child.stderr.take().context("failed to capture stderr")?;
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stdout).read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stderr).read_to_end(&mut buf);
        buf
    });

    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRun {
        exit_code: status.and_then(|s| s.code()),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
    })
}

/// A fix backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandAction {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandAction {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Parse a shell-ish command line: whitespace-split, no quoting. Fix
    /// commands in config are simple tool invocations, not scripts.
    pub fn parse(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

impl FixAction for CommandAction {
    fn invoke(&self, repo_root: &Path) -> Result<ActionOutcome> {
        let run = run_with_timeout(&self.program, &self.args, repo_root, self.timeout)?;

        if run.timed_out {
            return Ok(ActionOutcome::failure(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            )));
        }

        let items_affected = parse_items_affected(&run.stdout).unwrap_or(0);
        let note = if run.succeeded() {
            None
        } else {
            let tail = if run.stderr.trim().is_empty() {
                run.stdout.trim()
            } else {
                run.stderr.trim()
            };
            Some(truncate(tail, OUTPUT_TAIL_CHARS))
        };

        Ok(ActionOutcome {
            success: run.succeeded(),
            items_affected,
            note,
        })
    }
}

/// Scan stdout for an `items-affected: N` report line.
fn parse_items_affected(stdout: &str) -> Option<u32> {
    stdout.lines().rev().find_map(|line| {
        let rest = line.trim().strip_prefix("items-affected:")?;
        rest.trim().parse().ok()
    })
}

/// The actions available to one cycle, keyed by operation type.
///
/// Built from config overrides first, then project-type defaults. Operations
/// with neither are absent; the coordinator records an attempted run against
/// them as a failure so the policy engine learns to stop retrying.
pub struct ActionSet {
    actions: HashMap<OperationType, Box<dyn FixAction>>,
}

impl ActionSet {
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn insert(&mut self, op: OperationType, action: Box<dyn FixAction>) {
        self.actions.insert(op, action);
    }

    pub fn get(&self, op: OperationType) -> Option<&dyn FixAction> {
        self.actions.get(&op).map(|a| a.as_ref())
    }

    /// Assemble the standard set for a tree: per-operation command overrides
    /// from config, falling back to toolchain defaults for the project type.
    pub fn for_project(
        project: ProjectType,
        overrides: &HashMap<OperationType, String>,
        timeout: Duration,
    ) -> Self {
        let mut set = Self::empty();
        for op in OperationType::all() {
            if let Some(line) = overrides.get(&op) {
                if let Some(action) = CommandAction::parse(line, timeout) {
                    set.insert(op, Box::new(action));
                }
                continue;
            }
            if let Some((program, args)) = project::default_fix_command(project, op) {
                let args = args.into_iter().map(str::to_string).collect();
                set.insert(op, Box::new(CommandAction::new(program, args, timeout)));
            }
        }
        set
    }
}
