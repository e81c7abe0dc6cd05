//! Project type detection.
//!
//! Detects what kind of project a tracked tree is and maps that to a build
//! check command (for the safety gate) and default fix commands (for
//! operation types the operator has not configured explicitly).

use crate::ops::OperationType;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Node,
    Python,
    Go,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Rust => "Rust",
            ProjectType::Node => "Node.js",
            ProjectType::Python => "Python",
            ProjectType::Go => "Go",
            ProjectType::Unknown => "Unknown",
        }
    }

    /// Manifest files the safety gate treats as critical for this project.
    pub fn critical_files(&self) -> &'static [&'static str] {
        match self {
            ProjectType::Rust => &["Cargo.toml"],
            ProjectType::Node => &["package.json"],
            ProjectType::Python => &["pyproject.toml"],
            ProjectType::Go => &["go.mod"],
            ProjectType::Unknown => &[],
        }
    }
}

/// Detect project type from marker files in the tree root.
pub fn detect_project_type(repo_root: &Path) -> ProjectType {
    if repo_root.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if repo_root.join("package.json").exists() {
        ProjectType::Node
    } else if repo_root.join("pyproject.toml").exists()
        || repo_root.join("setup.py").exists()
        || repo_root.join("requirements.txt").exists()
    {
        ProjectType::Python
    } else if repo_root.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// Command used by the buildable safety check. `None` for unknown projects,
/// which pass the check with a note instead of failing it.
pub fn check_command(project: ProjectType) -> Option<(&'static str, Vec<&'static str>)> {
    match project {
        ProjectType::Rust => Some(("cargo", vec!["check", "--quiet"])),
        ProjectType::Node => Some(("npx", vec!["tsc", "--noEmit"])),
        ProjectType::Python => Some(("python3", vec!["-m", "compileall", "-q", "."])),
        ProjectType::Go => Some(("go", vec!["build", "./..."])),
        ProjectType::Unknown => None,
    }
}

/// Default external fix command for an operation type, when the toolchain
/// ships one. Operations without a default must be configured before the
/// coordinator will run them.
pub fn default_fix_command(
    project: ProjectType,
    op: OperationType,
) -> Option<(&'static str, Vec<&'static str>)> {
    match (project, op) {
        (ProjectType::Rust, OperationType::FormatFix) => Some(("cargo", vec!["fmt"])),
        (ProjectType::Rust, OperationType::LintFix) => Some((
            "cargo",
            vec!["clippy", "--fix", "--allow-dirty", "--allow-staged"],
        )),
        (ProjectType::Node, OperationType::FormatFix) => {
            Some(("npx", vec!["prettier", "--write", "."]))
        }
        (ProjectType::Node, OperationType::LintFix) => Some(("npx", vec!["eslint", "--fix", "."])),
        (ProjectType::Python, OperationType::FormatFix) => Some(("black", vec!["."])),
        (ProjectType::Python, OperationType::LintFix) => {
            Some(("ruff", vec!["check", "--fix", "."]))
        }
        (ProjectType::Python, OperationType::ImportCleanup) => Some(("isort", vec!["."])),
        (ProjectType::Go, OperationType::FormatFix) => Some(("gofmt", vec!["-w", "."])),
        (ProjectType::Go, OperationType::ImportCleanup) => {
            Some(("goimports", vec!["-w", "."]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_rust_project() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        assert_eq!(detect_project_type(tmp.path()), ProjectType::Rust);
    }

    #[test]
    fn unknown_project_has_no_check_command() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(detect_project_type(tmp.path()), ProjectType::Unknown);
        assert!(check_command(ProjectType::Unknown).is_none());
    }

    #[test]
    fn rust_format_default_is_cargo_fmt() {
        let (cmd, args) = default_fix_command(ProjectType::Rust, OperationType::FormatFix).unwrap();
        assert_eq!(cmd, "cargo");
        assert_eq!(args, vec!["fmt"]);
    }
}
