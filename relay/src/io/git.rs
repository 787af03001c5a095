//! Git adapter.
//!
//! Every invocation is a bounded subprocess call with captured output. The
//! wrapper stays small and explicit: callers that need to interpret a failing
//! command (merge, rebase, push) use [`Git::run`] and inspect the output;
//! everything else goes through [`Git::run_checked`].

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Bytes of git stdout/stderr kept per call.
const GIT_OUTPUT_LIMIT_BYTES: usize = 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One block of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name; `None` when detached or bare.
    pub branch: Option<String>,
}

/// One commit from [`Git::log`], newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub sha: String,
    pub subject: String,
    pub author: String,
    /// Committer date, ISO 8601.
    pub date: String,
}

/// Field separator for `git log --format`; cannot appear in subjects.
const LOG_FIELD_SEP: char = '\x1f';

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Same timeout, different working directory.
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self::new(workdir, self.timeout)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA a revision resolves to.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(output.success())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!("checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// `git worktree add -b <branch> <path> <base>`.
    #[instrument(skip_all, fields(branch = %branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<CommandOutput> {
        let path_arg = path.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, &path_arg, base])
    }

    /// Force-remove a worktree (uncommitted changes in it are discarded).
    pub fn worktree_remove(&self, path: &Path) -> Result<CommandOutput> {
        let path_arg = path.to_string_lossy();
        self.run(&["worktree", "remove", "--force", &path_arg])
    }

    /// Directory shared by all worktrees (`.git` of the main checkout).
    pub fn common_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--path-format=absolute", "--git-common-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    pub fn delete_branch(&self, branch: &str) -> Result<CommandOutput> {
        self.run(&["branch", "-D", branch])
    }

    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.run(&["push", remote, "--delete", branch])
    }

    /// Local branch names matching a glob such as `task/*`.
    pub fn list_branches(&self, pattern: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["branch", "--list", "--format=%(refname:short)", pattern])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn fetch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, branch])?;
        Ok(())
    }

    /// Merge `rev` into the checked-out branch; the caller interprets failure.
    pub fn merge(&self, rev: &str, message: &str) -> Result<CommandOutput> {
        self.run(&["merge", "--no-edit", "-m", message, rev])
    }

    pub fn merge_ff_only(&self, rev: &str) -> Result<CommandOutput> {
        self.run(&["merge", "--ff-only", rev])
    }

    pub fn merge_abort(&self) -> Result<CommandOutput> {
        self.run(&["merge", "--abort"])
    }

    /// True while a merge is stopped with `MERGE_HEAD` present.
    pub fn merge_in_progress(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?;
        Ok(output.success())
    }

    /// Paths left conflicted by a stopped merge or rebase.
    pub fn unmerged_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn rebase(&self, onto: &str) -> Result<CommandOutput> {
        self.run(&["rebase", onto])
    }

    pub fn rebase_abort(&self) -> Result<CommandOutput> {
        self.run(&["rebase", "--abort"])
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<CommandOutput> {
        self.run(&["push", remote, &format!("{branch}:{branch}")])
    }

    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev])?;
        Ok(())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(output.success())
    }

    /// Up to `limit` most recent commits reachable from `rev`.
    pub fn log(&self, rev: &str, limit: usize) -> Result<Vec<CommitSummary>> {
        let count = format!("--max-count={limit}");
        let format = "--format=%H%x1f%s%x1f%an%x1f%cI";
        let out = self.run_capture(&["log", &count, format, rev, "--"])?;
        out.lines().map(parse_log_line).collect()
    }

    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    pub fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    pub fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        debug!(args = %args.join(" "), workdir = %self.workdir.display(), "git");
        run_command_with_timeout(cmd, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .map_err(|err| err.context(format!("git {}", args.join(" "))))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_log_line(line: &str) -> Result<CommitSummary> {
    let mut fields = line.splitn(4, LOG_FIELD_SEP);
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(sha), Some(subject), Some(author), Some(date)) => Ok(CommitSummary {
            sha: sha.to_string(),
            subject: subject.to_string(),
            author: author.to_string(),
            date: date.to_string(),
        }),
        _ => Err(anyhow!("unexpected git log line: '{line}'")),
    }
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        }
    }
    entries.extend(current);
    entries
}
