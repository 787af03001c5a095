//! Poll loop and bounded worker pool.
//!
//! Each tick claims up to `max_parallel_workers - active` pending tasks,
//! oldest first, and hands each to a worker thread. Workers report back over
//! a channel; the loop owns the join handles. Stopping halts claims,
//! terminates every agent process group and waits for the workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::Coordinator;
use crate::core::types::{Failure, FailureKind, TaskRecord, TaskStatus};
use crate::error::{RelayError, failure_from_error};
use crate::io::config::RelayConfig;
use crate::io::paths::RelayPaths;
use crate::io::store::TaskStore;
use crate::io::supervisor::{GroupSupervisor, ProcessSupervisor};
use crate::io::verify::VerifyRunner;
use crate::io::workspace::WorkspaceManager;
use crate::pipeline::WorkerPipeline;

/// Summary recorded for tasks found `in_progress` at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: relay stopped while the task was in progress";

#[derive(Debug)]
enum LoopMsg {
    WorkerDone {
        task_id: String,
        status: Option<TaskStatus>,
    },
    Stop,
}

/// Whether the loop exits once nothing is pending and no worker is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Drain,
    Watch,
}

/// Outcome counts of the workers a loop run joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub plan_review: usize,
    /// Workers whose store writes failed; their tasks stay `in_progress`
    /// until the next recovery.
    pub errored: usize,
}

impl DispatchSummary {
    fn record(&mut self, status: Option<TaskStatus>) {
        match status {
            Some(TaskStatus::Completed) => self.completed += 1,
            Some(TaskStatus::Failed) => self.failed += 1,
            Some(TaskStatus::PlanReview) => self.plan_review += 1,
            Some(TaskStatus::Pending | TaskStatus::InProgress) => {}
            None => self.errored += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks moved from `in_progress` to `failed`.
    pub interrupted: Vec<String>,
    /// Task ids whose leftover workspace was removed.
    pub cleaned: Vec<String>,
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    coordinator: Arc<Coordinator>,
    supervisor: Arc<dyn ProcessSupervisor>,
    workspaces: Arc<WorkspaceManager>,
    pipeline: Arc<WorkerPipeline>,
    max_workers: usize,
    poll_interval: Duration,
    sender: Sender<LoopMsg>,
    receiver: Receiver<LoopMsg>,
}

impl Dispatcher {
    /// Wire every component for the repository at `paths.root()`.
    pub fn new(paths: RelayPaths, config: RelayConfig, verifier: Arc<dyn VerifyRunner>) -> Self {
        let coordinator = Arc::new(Coordinator::new(&config));
        let store = Arc::new(TaskStore::open(paths.clone()));
        let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(GroupSupervisor::new(
            Arc::clone(&coordinator),
            config.grace_period(),
            config.agent.stderr_limit_bytes,
        ));
        let workspaces = Arc::new(WorkspaceManager::new(
            paths.clone(),
            &config,
            Arc::clone(&coordinator),
        ));
        let max_workers = config.max_parallel_workers;
        let poll_interval = config.poll_interval();
        let pipeline = Arc::new(WorkerPipeline::new(
            paths,
            config,
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&supervisor),
            Arc::clone(&workspaces),
            verifier,
        ));
        let (sender, receiver) = mpsc::channel();
        Self {
            store,
            coordinator,
            supervisor,
            workspaces,
            pipeline,
            max_workers,
            poll_interval,
            sender,
            receiver,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Handle that can stop a running loop from another thread.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            sender: self.sender.clone(),
            coordinator: Arc::clone(&self.coordinator),
            supervisor: Arc::clone(&self.supervisor),
        }
    }

    /// Settle state left by a process that died mid-run.
    ///
    /// Must run before the loop starts and while no other relay process
    /// works on the same repository.
    #[instrument(skip_all)]
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let failure = Failure {
            kind: FailureKind::Interrupted,
            summary: INTERRUPTED_MESSAGE.to_string(),
            diagnostics: String::new(),
        };
        for task in self.store.list(Some(TaskStatus::InProgress))? {
            warn!(task_id = %task.id, "found interrupted task");
            self.store.finalize_failure(&task.id, &failure, None)?;
            report.interrupted.push(task.id);
        }

        for task_id in self.workspaces.leftover_ids()? {
            let owner = match self.store.get(&task_id) {
                Ok(task) => Some(task.status),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err),
            };
            if owner.is_some_and(|status| !status.is_terminal()) {
                continue;
            }
            self.workspaces
                .cleanup(&task_id)
                .with_context(|| format!("clean leftover workspace {task_id}"))?;
            report.cleaned.push(task_id);
        }

        if !report.interrupted.is_empty() || !report.cleaned.is_empty() {
            info!(
                interrupted = report.interrupted.len(),
                cleaned = report.cleaned.len(),
                "recovery finished"
            );
        }
        Ok(report)
    }

    /// Run the poll loop on the calling thread.
    #[instrument(skip_all, fields(mode = ?mode, max_workers = self.max_workers))]
    pub fn run(&self, mode: RunMode) -> Result<DispatchSummary> {
        let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut summary = DispatchSummary::default();
        let result = self.poll(mode, &mut active, &mut summary);
        if result.is_err() {
            // Still wait for what is running so no worker outlives the loop.
            self.coordinator.request_shutdown();
            self.supervisor.terminate_all();
        }
        for (task_id, handle) in active.drain() {
            if handle.join().is_err() {
                error!(task_id = %task_id, "worker panicked");
                summary.errored += 1;
            }
        }
        info!(?summary, "dispatcher stopped");
        result.map(|()| summary)
    }

    fn poll(
        &self,
        mode: RunMode,
        active: &mut HashMap<String, JoinHandle<()>>,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        loop {
            self.reap_finished(active, summary);
            let stopping = self.coordinator.is_shutting_down();
            if !stopping {
                self.fill_slots(active, summary)?;
            }
            if active.is_empty() && (stopping || mode == RunMode::Drain) {
                // Reports from workers reaped above may still be queued.
                while let Ok(msg) = self.receiver.try_recv() {
                    self.handle(msg, active, summary);
                }
                return Ok(());
            }

            match self.receiver.recv_timeout(self.poll_interval) {
                Ok(msg) => self.handle(msg, active, summary),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("dispatcher channel closed"));
                }
            }
        }
    }

    fn handle(
        &self,
        msg: LoopMsg,
        active: &mut HashMap<String, JoinHandle<()>>,
        summary: &mut DispatchSummary,
    ) {
        match msg {
            LoopMsg::WorkerDone { task_id, status } => {
                if let Some(handle) = active.remove(&task_id) {
                    if handle.join().is_err() {
                        error!(task_id = %task_id, "worker panicked");
                        summary.errored += 1;
                        return;
                    }
                }
                debug!(task_id = %task_id, ?status, "worker finished");
                summary.record(status);
            }
            LoopMsg::Stop => {
                info!(active = active.len(), "stop requested");
                self.coordinator.request_shutdown();
            }
        }
    }

    /// Join workers that ended without reporting (panics).
    fn reap_finished(
        &self,
        active: &mut HashMap<String, JoinHandle<()>>,
        summary: &mut DispatchSummary,
    ) {
        let finished: Vec<String> = active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in finished {
            let Some(handle) = active.remove(&task_id) else {
                continue;
            };
            if handle.join().is_err() {
                error!(task_id = %task_id, "worker panicked");
                summary.errored += 1;
            }
        }
    }

    fn fill_slots(
        &self,
        active: &mut HashMap<String, JoinHandle<()>>,
        summary: &mut DispatchSummary,
    ) -> Result<()> {
        let mut free = self.max_workers.saturating_sub(active.len());
        if free == 0 {
            return Ok(());
        }
        for task in self.store.list(Some(TaskStatus::Pending))? {
            if free == 0 {
                break;
            }
            if active.contains_key(&task.id) {
                continue;
            }
            let claimed = match self.store.claim(&task.id) {
                Ok(claimed) => claimed,
                Err(err) if is_claim_conflict(&err) => {
                    debug!(task_id = %task.id, "claimed elsewhere, skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let handle = match self.spawn_worker(claimed) {
                Ok(handle) => handle,
                Err(err) => {
                    self.store
                        .finalize_failure(&task.id, &failure_from_error(&err), None)?;
                    return Err(err);
                }
            };
            active.insert(task.id, handle);
            summary.dispatched += 1;
            free -= 1;
        }
        Ok(())
    }

    fn spawn_worker(&self, task: TaskRecord) -> Result<JoinHandle<()>> {
        let task_id = task.id.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let sender = self.sender.clone();
        let thread_name = format!("relay-worker-{task_id}");
        info!(task_id = %task_id, "dispatching task");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let status = match pipeline.run(task) {
                    Ok(record) => Some(record.status),
                    Err(err) => {
                        error!(
                            task_id = %task_id,
                            err = %format!("{err:#}"),
                            "worker could not record task outcome"
                        );
                        None
                    }
                };
                if sender.send(LoopMsg::WorkerDone { task_id, status }).is_err() {
                    debug!("dispatcher gone before worker reported");
                }
            })
            .with_context(|| format!("spawn {thread_name}"))
    }
}

/// Stops a running [`Dispatcher::run`] from any thread.
#[derive(Clone)]
pub struct Stopper {
    sender: Sender<LoopMsg>,
    coordinator: Arc<Coordinator>,
    supervisor: Arc<dyn ProcessSupervisor>,
}

impl Stopper {
    /// Halt new claims, terminate every agent group and wake the loop.
    /// The loop returns once in-flight workers have recorded their outcome.
    pub fn stop(&self) {
        self.coordinator.request_shutdown();
        self.supervisor.terminate_all();
        if self.sender.send(LoopMsg::Stop).is_err() {
            debug!("dispatcher already stopped");
        }
    }
}

fn is_claim_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::ClaimConflict { .. })
    )
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::TaskNotFound(_))
    )
}
