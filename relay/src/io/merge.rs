//! Integration of a finished task branch into the integration branch.
//!
//! One attempt is: (sync with remote) -> merge integration into the task
//! branch -> verify -> rebase onto integration -> fast-forward integration ->
//! (push). The whole retry loop runs under the coordinator's integration
//! lock, so a later task always rebases onto an earlier task's integrated
//! commit and pushes never race each other.
//!
//! Every failing attempt leaves the integration branch at the tip it had
//! when the attempt started.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::Coordinator;
use crate::error::RelayError;
use crate::io::config::{ConflictPolicy, RelayConfig};
use crate::io::git::Git;
use crate::io::paths::RelayPaths;
use crate::io::verify::{DEFAULT_OUTPUT_LIMIT_BYTES, VerifyOutcome, VerifyRequest, VerifyRunner};
use crate::io::workspace::Workspace;

/// Result of a successful integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Attempts used, 1-indexed.
    pub attempts: u32,
    /// Integration branch tip after the fast-forward.
    pub integrated_head: String,
}

pub struct MergePipeline {
    git: Git,
    integration_branch: String,
    remote: Option<String>,
    max_attempts: u32,
    conflict_policy: ConflictPolicy,
    verify: VerifyRequest,
    verifier: Arc<dyn VerifyRunner>,
    coordinator: Arc<Coordinator>,
}

impl MergePipeline {
    pub fn new(
        paths: &RelayPaths,
        config: &RelayConfig,
        verifier: Arc<dyn VerifyRunner>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            git: Git::new(paths.root(), config.git_timeout()),
            integration_branch: config.integration_branch.clone(),
            remote: config.active_remote().map(str::to_string),
            max_attempts: config.merge.max_attempts,
            conflict_policy: config.merge.conflict_policy,
            verify: VerifyRequest {
                workdir: paths.root().to_path_buf(),
                command: config.merge.verify_command.clone(),
                timeout: config.verify_timeout(),
                output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            },
            verifier,
            coordinator,
        }
    }

    /// Integrate `workspace.branch`, retrying moving-target failures.
    #[instrument(skip_all, fields(task_id = %workspace.task_id, branch = %workspace.branch))]
    pub fn integrate(&self, workspace: &Workspace) -> Result<MergeReport> {
        let _lock = self.coordinator.integration_lock();
        let mut history = String::new();
        let mut last = String::new();

        for attempt in 1..=self.max_attempts {
            match self.attempt(workspace) {
                Ok(integrated_head) => {
                    info!(attempt, head = %integrated_head, "branch integrated");
                    return Ok(MergeReport {
                        attempts: attempt,
                        integrated_head,
                    });
                }
                Err(err) if self.is_retryable(&err) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        err = %err,
                        "integration attempt failed, retrying"
                    );
                    last = err.to_string();
                    let details = err
                        .downcast_ref::<RelayError>()
                        .map(RelayError::diagnostics)
                        .unwrap_or_default();
                    history.push_str(&format!("=== attempt {attempt}: {err} ===\n{details}\n"));
                }
                Err(err) => return Err(err),
            }
        }

        Err(RelayError::MergeRetriesExhausted {
            branch: workspace.branch.clone(),
            attempts: self.max_attempts,
            last,
            diagnostics: history,
        }
        .into())
    }

    fn is_retryable(&self, err: &anyhow::Error) -> bool {
        match err.downcast_ref::<RelayError>() {
            Some(RelayError::MergeConflict { .. }) => self.conflict_policy == ConflictPolicy::Retry,
            Some(relay) => relay.is_retryable(),
            None => false,
        }
    }

    fn attempt(&self, workspace: &Workspace) -> Result<String> {
        let integration = self.integration_branch.as_str();
        let branch = workspace.branch.as_str();
        let task_git = self.git.at(&workspace.path);

        self.recover_stale_merge()?;
        self.ensure_on_integration()?;
        let pre_tip = self.git.rev_parse(integration)?;

        if let Some(remote) = &self.remote {
            self.git
                .fetch(remote, integration)
                .with_context(|| format!("fetch {remote}/{integration}"))?;
            let upstream = format!("{remote}/{integration}");
            let output = self.git.merge_ff_only(&upstream)?;
            if !output.success() {
                return Err(anyhow!(
                    "{integration} has diverged from {upstream}: {}",
                    output.stderr_lossy().trim()
                ));
            }
        }

        let output = task_git.merge(integration, &format!("Merge {integration} into {branch}"))?;
        if !output.success() {
            let conflicted = task_git.unmerged_paths().unwrap_or_default();
            self.abort_task_merge(&task_git);
            self.restore_tip(&pre_tip)?;
            let mut details = String::new();
            if !conflicted.is_empty() {
                details.push_str(&format!("conflicted paths:\n  {}\n\n", conflicted.join("\n  ")));
            }
            details.push_str(&output.diagnostics("git merge"));
            return Err(RelayError::MergeConflict {
                branch: branch.to_string(),
                details,
            }
            .into());
        }

        let request = VerifyRequest {
            workdir: workspace.path.clone(),
            ..self.verify.clone()
        };
        match self.verifier.run(&request)? {
            VerifyOutcome::Fail { output } => {
                self.restore_tip(&pre_tip)?;
                return Err(RelayError::VerificationFailure {
                    branch: branch.to_string(),
                    output,
                }
                .into());
            }
            VerifyOutcome::Pass => debug!("verification passed"),
            VerifyOutcome::Skipped => debug!("no verify command configured"),
        }

        let output = task_git.rebase(integration)?;
        if !output.success() {
            if let Err(err) = task_git.rebase_abort() {
                warn!(err = %format!("{err:#}"), "rebase --abort failed");
            }
            self.restore_tip(&pre_tip)?;
            return Err(RelayError::MergeConflict {
                branch: branch.to_string(),
                details: output.diagnostics("git rebase"),
            }
            .into());
        }

        let output = self.git.merge_ff_only(branch)?;
        if !output.success() {
            self.restore_tip(&pre_tip)?;
            return Err(anyhow!(
                "fast-forward {integration} to {branch} failed: {}",
                output.stderr_lossy().trim()
            ));
        }

        if let Some(remote) = &self.remote {
            let output = self.git.push(remote, integration)?;
            if !output.success() {
                self.restore_tip(&pre_tip)?;
                return Err(RelayError::PushConflict {
                    branch: branch.to_string(),
                    stderr: output.stderr_lossy(),
                }
                .into());
            }
            debug!(remote = %remote, "pushed integration branch");
        }

        self.git.rev_parse(integration)
    }

    /// Abort a merge left in the root checkout by an earlier crash.
    fn recover_stale_merge(&self) -> Result<()> {
        if !self.git.merge_in_progress()? {
            return Ok(());
        }
        warn!("stale merge in root checkout, aborting");
        let output = self.git.merge_abort()?;
        if !output.success() {
            warn!(stderr = %output.stderr_lossy().trim(), "merge --abort failed, resetting");
            self.git.reset_hard("HEAD")?;
        }
        Ok(())
    }

    fn ensure_on_integration(&self) -> Result<()> {
        if self.git.current_branch()? != self.integration_branch {
            self.git.checkout_branch(&self.integration_branch)?;
        }
        Ok(())
    }

    fn abort_task_merge(&self, task_git: &Git) {
        match task_git.merge_abort() {
            Ok(output) if output.success() => {}
            _ => {
                warn!("merge --abort failed in workspace, resetting");
                if let Err(err) = task_git.reset_hard("HEAD") {
                    warn!(err = %format!("{err:#}"), "workspace reset failed");
                }
            }
        }
    }

    fn restore_tip(&self, pre_tip: &str) -> Result<()> {
        let current = self.git.rev_parse(&self.integration_branch)?;
        if current == pre_tip {
            return Ok(());
        }
        warn!(from = %current, to = %pre_tip, "restoring integration branch tip");
        self.ensure_on_integration()?;
        self.git.reset_hard(pre_tip)
    }
}
