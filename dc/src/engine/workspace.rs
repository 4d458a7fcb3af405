//! Workspace - file operations scoped to the repository root
//!
//! Every path an engine touches is resolved against the base directory and
//! rejected if it escapes it.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::debug;
use walkdir::WalkDir;

use super::{EngineError, FileEdit};

/// Directories never listed in the repo map
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Walk up from `start` to the nearest directory holding `.git`
pub fn find_repo_root(start: &Path) -> Result<PathBuf, EngineError> {
    debug!(?start, "find_repo_root: called");
    let start = start.canonicalize().map_err(|_| EngineError::NotARepository(start.to_path_buf()))?;

    for dir in start.ancestors() {
        if dir.join(".git").exists() {
            debug!(root = ?dir, "find_repo_root: found repository root");
            return Ok(dir.to_path_buf());
        }
    }

    debug!("find_repo_root: no .git found");
    Err(EngineError::NotARepository(start))
}

/// Output of a shell command run in the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout followed by stderr
    pub output: String,
}

/// File operations rooted at a base directory
#[derive(Debug, Clone)]
pub struct Workspace {
    base_dir: PathBuf,
}

impl Workspace {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let base_dir = base_dir.canonicalize().unwrap_or(base_dir);
        debug!(?base_dir, "Workspace::new: called");
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve `path` inside the base directory
    ///
    /// Works for files that do not exist yet. `..` components are folded
    /// lexically before the containment check.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, EngineError> {
        debug!(%path, "Workspace::resolve: called");
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        // Resolve symlinks for anything that already exists
        let resolved = if normalized.exists() {
            normalized.canonicalize().unwrap_or(normalized)
        } else {
            normalized
        };

        if resolved.starts_with(&self.base_dir) {
            Ok(resolved)
        } else {
            debug!(?resolved, "Workspace::resolve: path escapes base directory");
            Err(EngineError::OutsideBaseDir {
                path: PathBuf::from(path),
                base_dir: self.base_dir.clone(),
            })
        }
    }

    /// Path relative to the base directory, with forward slashes
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.base_dir).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, path: &str) -> Result<String, EngineError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(EngineError::FileNotFound(path.to_string()));
        }
        Ok(fs::read_to_string(resolved)?)
    }

    /// Write `content`, creating parent directories as needed
    pub fn write(&self, path: &str, content: &str) -> Result<(), EngineError> {
        debug!(%path, len = content.len(), "Workspace::write: called");
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(resolved, content)?;
        Ok(())
    }

    /// Replace the first occurrence of `edit.original` with `edit.updated`
    ///
    /// An empty `original` on a missing file creates it with `updated`.
    pub fn apply_edit(&self, edit: &FileEdit) -> Result<(), EngineError> {
        debug!(path = %edit.path, "Workspace::apply_edit: called");
        if edit.original.is_empty() && !self.exists(&edit.path) {
            debug!("Workspace::apply_edit: creating new file");
            return self.write(&edit.path, &edit.updated);
        }

        let content = self.read(&edit.path)?;
        let Some(pos) = content.find(&edit.original) else {
            debug!("Workspace::apply_edit: original text not found");
            return Err(EngineError::PatternNotFound {
                path: edit.path.clone(),
            });
        };

        let mut updated = String::with_capacity(content.len() + edit.updated.len());
        updated.push_str(&content[..pos]);
        updated.push_str(&edit.updated);
        updated.push_str(&content[pos + edit.original.len()..]);
        self.write(&edit.path, &updated)
    }

    /// Every file in the repository, relative and sorted
    pub fn list_files(&self) -> Vec<String> {
        debug!("Workspace::list_files: called");
        let mut files: Vec<String> = WalkDir::new(&self.base_dir)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir() && SKIPPED_DIRS.iter().any(|skip| entry.file_name() == *skip))
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| self.relative(entry.path()))
            .collect();
        files.sort();
        files
    }

    /// Run `command` with `sh -c` in the base directory
    pub fn run_shell(&self, command: &str) -> Result<CommandOutput, EngineError> {
        debug!(%command, "Workspace::run_shell: called");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.base_dir)
            .output()?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(%exit_code, "Workspace::run_shell: command completed");
        Ok(CommandOutput { exit_code, output: text })
    }
}
