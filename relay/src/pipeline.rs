//! One worker pipeline per claimed task.
//!
//! Planning run (read-only, no workspace, no port) for tasks awaiting a plan;
//! otherwise port -> workspace -> agent -> merge -> finalize -> cleanup ->
//! port release. The store is always finalized before the workspace goes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{Coordinator, PortLease};
use crate::core::types::TaskRecord;
use crate::error::{RelayError, failure_from_error};
use crate::io::config::{PROMPT_PLACEHOLDER, RelayConfig};
use crate::io::git::Git;
use crate::io::merge::MergePipeline;
use crate::io::paths::RelayPaths;
use crate::io::prompt::PromptBuilder;
use crate::io::session_log::SessionLog;
use crate::io::store::TaskStore;
use crate::io::supervisor::{ExitOutcome, ProcessSupervisor, SpawnRequest};
use crate::io::verify::VerifyRunner;
use crate::io::workspace::{Workspace, WorkspaceManager};

pub const TASK_ID_ENV: &str = "RELAY_TASK_ID";
pub const TASK_PORT_ENV: &str = "TASK_PORT";

pub struct WorkerPipeline {
    paths: RelayPaths,
    config: RelayConfig,
    store: Arc<TaskStore>,
    coordinator: Arc<Coordinator>,
    supervisor: Arc<dyn ProcessSupervisor>,
    workspaces: Arc<WorkspaceManager>,
    merge: MergePipeline,
    prompts: PromptBuilder,
}

impl WorkerPipeline {
    pub fn new(
        paths: RelayPaths,
        config: RelayConfig,
        store: Arc<TaskStore>,
        coordinator: Arc<Coordinator>,
        supervisor: Arc<dyn ProcessSupervisor>,
        workspaces: Arc<WorkspaceManager>,
        verifier: Arc<dyn VerifyRunner>,
    ) -> Self {
        let merge = MergePipeline::new(&paths, &config, verifier, Arc::clone(&coordinator));
        Self {
            paths,
            config,
            store,
            coordinator,
            supervisor,
            workspaces,
            merge,
            prompts: PromptBuilder::default(),
        }
    }

    /// Drive a claimed (`in_progress`) task to its next resting status.
    ///
    /// Step failures are recorded on the task and do not surface here; an
    /// `Err` means the store itself could not be written.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn run(&self, task: TaskRecord) -> Result<TaskRecord> {
        if task.needs_planning() {
            return self.run_planning(&task);
        }
        self.run_execution(&task)
    }

    fn run_planning(&self, task: &TaskRecord) -> Result<TaskRecord> {
        info!("planning");
        let mut session = None;
        match self.plan(task, &mut session) {
            Ok(plan_text) => {
                let record = self.store.enter_plan_review(&task.id, &plan_text)?;
                info!(chars = plan_text.len(), "plan ready for review");
                Ok(record)
            }
            Err(err) => self
                .store
                .finalize_failure(&task.id, &failure_from_error(&err), session.as_ref()),
        }
    }

    fn plan(&self, task: &TaskRecord, session: &mut Option<SessionLog>) -> Result<String> {
        let prompt = self.prompts.plan(task)?;
        let mut argv = agent_argv(&self.config.agent.command, &prompt);
        argv.extend(self.config.agent.plan_args.iter().cloned());
        let request = SpawnRequest {
            task_id: task.id.clone(),
            argv,
            workdir: self.paths.root().to_path_buf(),
            env: vec![(TASK_ID_ENV.to_string(), task.id.clone())],
        };
        let log = session.insert(SessionLog::default());
        self.run_agent(request, log)?;
        log.plan_text()
            .ok_or_else(|| RelayError::PlanExtractionFailure.into())
    }

    fn run_execution(&self, task: &TaskRecord) -> Result<TaskRecord> {
        info!("executing");
        let mut lease = None;
        let mut session = None;
        let outcome = self.execute(task, &mut lease, &mut session);
        let record = match outcome {
            Ok(()) => self.store.finalize_success(&task.id, session.as_ref())?,
            Err(err) => self.store.finalize_failure(
                &task.id,
                &failure_from_error(&err),
                session.as_ref(),
            )?,
        };
        if let Err(err) = self.workspaces.cleanup(&task.id) {
            warn!(err = %format!("{err:#}"), "workspace cleanup failed; recovery will retry");
        }
        drop(lease);
        Ok(record)
    }

    fn execute(
        &self,
        task: &TaskRecord,
        lease: &mut Option<PortLease>,
        session: &mut Option<SessionLog>,
    ) -> Result<()> {
        let port = self.lease_port(&task.id, lease)?;
        let workspace = self.workspaces.create(&task.id)?;

        let plan = self.store.plan_content(task)?;
        let prompt = self.prompts.execute(task, plan.as_deref(), port)?;
        let mut env = vec![(TASK_ID_ENV.to_string(), task.id.clone())];
        if let Some(port) = port {
            env.push((TASK_PORT_ENV.to_string(), port.to_string()));
        }
        let request = SpawnRequest {
            task_id: task.id.clone(),
            argv: agent_argv(&self.config.agent.command, &prompt),
            workdir: workspace.path.clone(),
            env,
        };
        self.run_agent(request, session.insert(SessionLog::default()))?;

        self.commit_leftovers(task, &workspace)?;
        let report = self.merge.integrate(&workspace)?;
        debug!(attempts = report.attempts, head = %report.integrated_head, "merged");
        Ok(())
    }

    fn lease_port(&self, task_id: &str, lease: &mut Option<PortLease>) -> Result<Option<u16>> {
        let pool = self.coordinator.ports();
        if !pool.is_enabled() {
            return Ok(None);
        }
        let leased = pool
            .lease()
            .ok_or_else(|| anyhow!("port pool exhausted"))?;
        let port = leased.port();
        *lease = Some(leased);
        self.store.assign_port(task_id, port)?;
        debug!(port, "port assigned");
        Ok(Some(port))
    }

    /// Stream events on this thread while the exit waiter runs on another.
    fn run_agent(&self, request: SpawnRequest, log: &mut SessionLog) -> Result<()> {
        let timeout = self.config.agent_timeout();
        let handle = self.supervisor.spawn(request)?;
        let waiter = {
            let supervisor = Arc::clone(&self.supervisor);
            let handle = Arc::clone(&handle);
            thread::spawn(move || supervisor.await_exit(&handle, timeout))
        };
        match self.supervisor.stream_events(&handle) {
            Ok(stream) => {
                for decoded in stream {
                    log.record(decoded);
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "agent output unavailable"),
        }
        let outcome = waiter
            .join()
            .map_err(|_| anyhow!("agent exit waiter panicked"))??;
        debug!(
            events = log.summary.total_events,
            skipped = log.summary.skipped,
            "agent output consumed"
        );
        check_outcome(outcome, timeout, || handle.stderr_output())
    }

    /// Commit whatever the agent left uncommitted in its worktree.
    fn commit_leftovers(&self, task: &TaskRecord, workspace: &Workspace) -> Result<()> {
        let git = Git::new(&workspace.path, self.config.git_timeout());
        git.add_all()?;
        if git.commit_staged(&format!("feat({}): {}", task.id, task.title))? {
            info!("committed uncommitted agent changes");
        }
        if git.rev_parse("HEAD")? == git.rev_parse(&self.config.integration_branch)? {
            warn!("agent produced no commits");
        }
        Ok(())
    }
}

fn check_outcome(
    outcome: ExitOutcome,
    timeout: Duration,
    stderr: impl FnOnce() -> String,
) -> Result<()> {
    match outcome {
        ExitOutcome::Success => Ok(()),
        ExitOutcome::Timeout => Err(RelayError::ProcessTimeout(timeout).into()),
        ExitOutcome::Cancelled => Err(RelayError::Cancelled.into()),
        ExitOutcome::NonZero(_) | ExitOutcome::Signaled(_) => Err(RelayError::ProcessCrash {
            outcome: outcome.to_string(),
            stderr: stderr(),
        }
        .into()),
    }
}

/// Substitute the prompt into the configured argv, appending it when no
/// argument carries the placeholder.
pub fn agent_argv(command: &[String], prompt: &str) -> Vec<String> {
    let mut substituted = false;
    let mut argv: Vec<String> = command
        .iter()
        .map(|arg| {
            if arg.contains(PROMPT_PLACEHOLDER) {
                substituted = true;
                arg.replace(PROMPT_PLACEHOLDER, prompt)
            } else {
                arg.clone()
            }
        })
        .collect();
    if !substituted {
        argv.push(prompt.to_string());
    }
    argv
}
