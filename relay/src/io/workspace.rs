//! Per-task git worktrees under `.relay/worktrees/<id>`.
//!
//! Creation and cleanup mutate repository refs, so both run under the
//! coordinator's integration lock. Cleanup is idempotent: it tolerates a
//! missing directory, a missing branch and an already-merged branch.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::Coordinator;
use crate::core::ids::{BRANCH_PREFIX, branch_name, validate_id};
use crate::error::RelayError;
use crate::io::config::RelayConfig;
use crate::io::git::{Git, WorktreeEntry};
use crate::io::paths::RelayPaths;

/// An isolated working directory bound to `task/<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorkspaceManager {
    paths: RelayPaths,
    git: Git,
    integration_branch: String,
    shared_files: Vec<String>,
    isolated_files: Vec<String>,
    remote_cleanup: Option<String>,
    coordinator: Arc<Coordinator>,
}

impl WorkspaceManager {
    pub fn new(paths: RelayPaths, config: &RelayConfig, coordinator: Arc<Coordinator>) -> Self {
        let git = Git::new(paths.root(), config.git_timeout());
        let remote_cleanup = (config.workspace.delete_remote_branches && config.push_to_remote)
            .then(|| config.remote.clone());
        Self {
            paths,
            git,
            integration_branch: config.integration_branch.clone(),
            shared_files: config.workspace.shared_files.clone(),
            isolated_files: config.workspace.isolated_files.clone(),
            remote_cleanup,
            coordinator,
        }
    }

    /// Branch a fresh worktree off the integration tip and populate it.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn create(&self, task_id: &str) -> Result<Workspace> {
        validate_id(task_id)?;
        let _lock = self.coordinator.integration_lock();

        // A crashed earlier attempt may have left the directory or branch.
        self.cleanup_locked(task_id)?;

        let path = self.paths.worktree_path(task_id);
        let branch = branch_name(task_id);
        let parent = self.paths.worktrees_dir();
        fs::create_dir_all(&parent)
            .with_context(|| format!("create worktrees dir {}", parent.display()))?;

        let output = self
            .git
            .worktree_add(&path, &branch, &self.integration_branch)?;
        if !output.success() {
            return Err(RelayError::WorkspaceError {
                task_id: task_id.to_string(),
                message: format!(
                    "git worktree add {} from {} failed",
                    path.display(),
                    self.integration_branch
                ),
                diagnostics: output.diagnostics("git worktree add"),
            }
            .into());
        }

        if let Err(err) = self.populate(&path) {
            let diagnostics = format!("{err:#}");
            if let Err(cleanup_err) = self.cleanup_locked(task_id) {
                warn!(
                    err = %format!("{cleanup_err:#}"),
                    "cleanup after failed populate also failed"
                );
            }
            return Err(RelayError::WorkspaceError {
                task_id: task_id.to_string(),
                message: "populate workspace files".to_string(),
                diagnostics,
            }
            .into());
        }

        info!(path = %path.display(), branch = %branch, "workspace created");
        Ok(Workspace {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    /// Remove the worktree and its branch. Safe to call repeatedly.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn cleanup(&self, task_id: &str) -> Result<()> {
        validate_id(task_id)?;
        let _lock = self.coordinator.integration_lock();
        self.cleanup_locked(task_id)
    }

    /// Worktrees this manager owns, as git reports them.
    pub fn list(&self) -> Result<Vec<WorktreeEntry>> {
        let dir = self.paths.worktrees_dir();
        let entries = self.git.worktree_list()?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.path.starts_with(&dir))
            .collect())
    }

    /// Task ids that still have a worktree directory or a `task/*` branch.
    pub fn leftover_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let dir = self.paths.worktrees_dir();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
                let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        for branch in self.git.list_branches(&format!("{BRANCH_PREFIX}*"))? {
            if let Some(id) = branch.strip_prefix(BRANCH_PREFIX) {
                ids.push(id.to_string());
            }
        }
        ids.retain(|id| validate_id(id).is_ok());
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn cleanup_locked(&self, task_id: &str) -> Result<()> {
        let path = self.paths.worktree_path(task_id);
        let branch = branch_name(task_id);

        if path.exists() {
            let output = self.git.worktree_remove(&path)?;
            if !output.success() {
                warn!(
                    stderr = %output.stderr_lossy().trim(),
                    "git worktree remove failed, deleting directory"
                );
            }
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|err| RelayError::WorkspaceError {
                    task_id: task_id.to_string(),
                    message: format!("remove {}", path.display()),
                    diagnostics: err.to_string(),
                })?;
            }
            debug!(path = %path.display(), "workspace directory removed");
        }
        if let Err(err) = self.git.worktree_prune() {
            warn!(err = %format!("{err:#}"), "git worktree prune failed");
        }

        if self.git.branch_exists(&branch)? {
            let output = self.git.delete_branch(&branch)?;
            if output.success() {
                debug!(branch = %branch, "branch deleted");
            } else {
                warn!(
                    branch = %branch,
                    stderr = %output.stderr_lossy().trim(),
                    "branch delete failed"
                );
            }
        }
        if let Some(remote) = &self.remote_cleanup {
            let output = self.git.delete_remote_branch(remote, &branch)?;
            if !output.success() {
                debug!(
                    branch = %branch,
                    stderr = %output.stderr_lossy().trim(),
                    "remote branch delete skipped"
                );
            }
        }
        Ok(())
    }

    /// Link shared files and copy isolated files from the root checkout.
    ///
    /// Files placed here that the branch does not track are added to the
    /// repository's exclude list so the agent's `git add -A` skips them.
    fn populate(&self, workspace: &Path) -> Result<()> {
        let root = self.paths.root();
        let mut untracked = Vec::new();
        for file in &self.shared_files {
            let source = root.join(file);
            if !source.exists() {
                debug!(file = %file, "shared file missing in root, skipping");
                continue;
            }
            let target = workspace.join(file);
            if target.exists() {
                // Tracked in the branch: leave the checked-out copy alone.
                debug!(file = %file, "shared file tracked, not linking");
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            std::os::unix::fs::symlink(&source, &target)
                .with_context(|| format!("link {} -> {}", target.display(), source.display()))?;
            untracked.push(file.as_str());
        }

        for file in &self.isolated_files {
            let source = root.join(file);
            if !source.is_file() {
                continue;
            }
            let target = workspace.join(file);
            if !target.exists() {
                untracked.push(file.as_str());
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("copy {} -> {}", source.display(), target.display()))?;
        }

        if !untracked.is_empty() {
            self.exclude(&untracked)?;
        }
        Ok(())
    }

    fn exclude(&self, files: &[&str]) -> Result<()> {
        let exclude = self.git.common_dir()?.join("info").join("exclude");
        let existing = fs::read_to_string(&exclude).unwrap_or_default();
        let missing: Vec<String> = files
            .iter()
            .map(|file| format!("/{file}"))
            .filter(|line| !existing.lines().any(|l| l.trim() == line))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)
            .with_context(|| format!("open {}", exclude.display()))?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file).with_context(|| format!("write {}", exclude.display()))?;
        }
        for line in missing {
            writeln!(file, "{line}").with_context(|| format!("write {}", exclude.display()))?;
        }
        Ok(())
    }
}
