//! Fixtures for unit and integration tests: throwaway git repositories,
//! scripted agents and a scripted verifier.

use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::dispatcher::Dispatcher;
use crate::io::config::RelayConfig;
use crate::io::git::Git;
use crate::io::init::InitOptions;
use crate::io::paths::RelayPaths;
use crate::io::verify::{VerifyOutcome, VerifyRequest, VerifyRunner};

/// Agent that commits one marker file per task and emits a stream with one
/// malformed line. For planning prompts it prints a plan and touches nothing.
pub const COMMITTING_AGENT: &str = r#"#!/bin/sh
set -e
case "$1" in
  *"Do not modify any files"*)
    echo '{"type":"system","subtype":"init"}'
    echo '{"type":"assistant","message":{"content":[{"type":"text","text":"1. add the marker file"}]}}'
    echo '{"type":"result","result":"2. commit it"}'
    exit 0
    ;;
esac
echo '{"type":"system","subtype":"init"}'
echo 'this line is not json'
printf '%s\n' "$RELAY_TASK_ID" > "task-$RELAY_TASK_ID.txt"
git add "task-$RELAY_TASK_ID.txt"
git commit -q -m "feat($RELAY_TASK_ID): add marker"
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{}}]}}'
echo "{\"type\":\"result\",\"result\":\"port=${TASK_PORT:-none}\"}"
"#;

/// Agent that exits non-zero after writing to stderr.
pub const CRASHING_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init"}'
echo "agent exploded" >&2
exit 3
"#;

/// A git repository on `main` with one commit, optionally with a bare
/// `origin` it is pushed to.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
    origin: Option<PathBuf>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
        run_git(&root, &["init", "-q", "-b", "main"])?;
        run_git(&root, &["config", "user.name", "Relay Test"])?;
        run_git(&root, &["config", "user.email", "relay-test@local.invalid"])?;
        run_git(&root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "# fixture\n").context("write README")?;
        run_git(&root, &["add", "."])?;
        run_git(&root, &["commit", "-q", "-m", "chore: initial commit"])?;
        Ok(Self {
            temp,
            root,
            origin: None,
        })
    }

    /// Same as [`TestRepo::new`] plus a bare `origin` tracking `main`.
    pub fn with_origin() -> Result<Self> {
        let mut repo = Self::new()?;
        let origin = repo.temp.path().join("origin.git");
        run_git(
            repo.temp.path(),
            &["init", "-q", "--bare", "-b", "main", &origin.to_string_lossy()],
        )?;
        run_git(&repo.root, &["remote", "add", "origin", &origin.to_string_lossy()])?;
        run_git(&repo.root, &["push", "-q", "-u", "origin", "main"])?;
        repo.origin = Some(origin);
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> RelayPaths {
        RelayPaths::new(&self.root)
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root, Duration::from_secs(30))
    }

    /// Scaffold `.relay/` so state and worktrees stay out of `git status`.
    pub fn init_relay(&self) -> Result<RelayPaths> {
        crate::io::init::init_relay(&self.root, &InitOptions { force: false })
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Write `contents` to `rel` on the checked-out branch and commit it.
    pub fn commit_file(&self, rel: &str, contents: &str, message: &str) -> Result<String> {
        commit_file_in(&self.root, rel, contents, message)
    }

    /// Install an executable script outside the repository.
    pub fn write_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let dir = self.temp.path().join("bin");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
        Ok(path)
    }

    /// Fast-polling config running `agent`, pushing when an origin exists.
    pub fn config(&self, agent: &Path) -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.agent.command = vec![agent.to_string_lossy().into_owned()];
        cfg.agent.timeout_secs = 30;
        cfg.agent.grace_period_ms = 200;
        cfg.poll_interval_ms = 50;
        cfg.ports.start = 9300;
        cfg.ports.end = 9309;
        cfg.push_to_remote = self.origin.is_some();
        cfg.merge.git_timeout_secs = 30;
        cfg.merge.verify_timeout_secs = 30;
        cfg
    }

    pub fn dispatcher(&self, config: RelayConfig, verifier: Arc<dyn VerifyRunner>) -> Dispatcher {
        Dispatcher::new(self.paths(), config, verifier)
    }

    /// Commit subjects on `rev`, newest first.
    pub fn log_subjects(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.git().run_capture(&["log", "--format=%s", rev])?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

/// Write and commit a file inside any checkout (root or worktree).
pub fn commit_file_in(dir: &Path, rel: &str, contents: &str, message: &str) -> Result<String> {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    run_git(dir, &["add", rel])?;
    run_git(dir, &["commit", "-q", "-m", message])?;
    let head = run_git(dir, &["rev-parse", "HEAD"])?;
    Ok(head.trim().to_string())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Verifier returning queued outcomes, then `Pass`.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    outcomes: Mutex<VecDeque<VerifyOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<VerifyOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn passing() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VerifyRunner for ScriptedVerifier {
    fn run(&self, _request: &VerifyRequest) -> Result<VerifyOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or(VerifyOutcome::Pass))
    }
}
