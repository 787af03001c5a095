//! Authoritative task store (`.relay/state/tasks.json`).
//!
//! Every mutation is one locked read-modify-write of the record file followed
//! by the mirror update. Status changes are validated by
//! [`check_transition`], so a claim is exclusive: of N concurrent callers on
//! the same pending task, exactly one observes `pending`.
//!
//! Sidecars follow two rules. Content a record will reference (plan text,
//! session log, error log) is written before the record commits. Content a
//! record stops referencing is removed after it commits.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::ids::{branch_name, new_id};
use crate::core::transitions::{TransitionCause, check_transition};
use crate::core::types::{
    Failure, FailureKind, NewTask, StatusCounts, TaskDetail, TaskRecord, TaskStatus,
};
use crate::error::RelayError;
use crate::io::mirror::mirror_task;
use crate::io::paths::RelayPaths;
use crate::io::records::{
    RecordLock, load_or_default, remove_if_exists, write_atomic, write_json_atomic,
};
use crate::io::session_log::SessionLog;

/// Error summary recorded when a reviewer rejects a plan.
pub const PLAN_REJECTED_MESSAGE: &str = "Plan rejected by user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub total: usize,
    pub counts: StatusCounts,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskBook {
    #[serde(default)]
    tasks: BTreeMap<String, TaskRecord>,
}

/// Single writer path for task records.
#[derive(Debug)]
pub struct TaskStore {
    paths: RelayPaths,
    lock: RecordLock,
}

impl TaskStore {
    pub fn open(paths: RelayPaths) -> Self {
        let lock = RecordLock::new(&paths.tasks_path());
        Self { paths, lock }
    }

    pub fn paths(&self) -> &RelayPaths {
        &self.paths
    }

    /// Create a task in `pending`.
    #[instrument(skip_all, fields(title = %input.title))]
    pub fn create(&self, input: NewTask) -> Result<TaskRecord> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let mut id = new_id();
        while book.tasks.contains_key(&id) {
            id = new_id();
        }
        let record = fresh_record(id.clone(), input, None);
        book.tasks.insert(id.clone(), record.clone());
        self.commit(&book, &record)?;
        info!(task_id = %id, "task created");
        Ok(record)
    }

    /// Create several tasks in one commit (plan execution).
    pub fn create_many(&self, inputs: Vec<NewTask>, plan_id: &str) -> Result<Vec<TaskRecord>> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut id = new_id();
            while book.tasks.contains_key(&id) {
                id = new_id();
            }
            let record = fresh_record(id.clone(), input, Some(plan_id));
            book.tasks.insert(id, record.clone());
            created.push(record);
        }
        let path = self.paths.tasks_path();
        write_json_atomic(&path, &book).with_context(|| format!("commit {}", path.display()))?;
        for record in &created {
            self.mirror(record);
        }
        info!(plan_id, count = created.len(), "tasks created from plan");
        Ok(created)
    }

    /// Take exclusive ownership of a pending task.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn claim(&self, task_id: &str) -> Result<TaskRecord> {
        self.update(task_id, |record| {
            let next = check_transition(record.status, TransitionCause::Claim).map_err(|_| {
                RelayError::ClaimConflict {
                    task_id: record.id.clone(),
                    status: record.status,
                }
            })?;
            record.status = next;
            Ok(())
        })
    }

    /// Record the port leased to an in-progress task.
    pub fn assign_port(&self, task_id: &str, port: u16) -> Result<TaskRecord> {
        self.update(task_id, |record| {
            if record.status != TaskStatus::InProgress {
                return Err(RelayError::InvalidTransition {
                    task_id: record.id.clone(),
                    reason: format!(
                        "port assignment requires in_progress, task is {}",
                        record.status
                    ),
                }
                .into());
            }
            record.assigned_port = Some(port);
            Ok(())
        })
    }

    /// Validated status change with an extra field update applied in the
    /// same commit.
    pub fn transition(
        &self,
        task_id: &str,
        cause: TransitionCause,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord> {
        let record = self.update(task_id, |record| {
            let next = check_transition(record.status, cause).map_err(|reason| {
                RelayError::InvalidTransition {
                    task_id: record.id.clone(),
                    reason,
                }
            })?;
            record.status = next;
            apply(record);
            Ok(())
        })?;
        debug!(task_id, cause = cause.as_str(), status = %record.status, "task transitioned");
        Ok(record)
    }

    /// Persist the plan sidecar, then move the task to `plan_review`.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn enter_plan_review(&self, task_id: &str, plan_text: &str) -> Result<TaskRecord> {
        let plan_ref = RelayPaths::plan_ref(task_id);
        let mut body = plan_text.trim_end().to_string();
        body.push('\n');
        write_atomic(&self.paths.resolve_ref(&plan_ref), &body)
            .with_context(|| format!("write plan sidecar for {task_id}"))?;
        self.transition(task_id, TransitionCause::PlanReady, |record| {
            record.plan_ref = Some(plan_ref);
            record.assigned_port = None;
        })
    }

    /// Terminal success. Durable before the workspace is torn down.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn finalize_success(
        &self,
        task_id: &str,
        session: Option<&SessionLog>,
    ) -> Result<TaskRecord> {
        let session_ref = self.write_session(task_id, session)?;
        let record = self.transition(task_id, TransitionCause::Success, |record| {
            record.session_log_ref = session_ref;
            record.assigned_port = None;
            record.error = None;
            record.failure_kind = None;
        })?;
        info!(task_id, "task completed");
        Ok(record)
    }

    /// Terminal failure with diagnostics in the error-log sidecar.
    #[instrument(skip_all, fields(task_id = %task_id, kind = ?failure.kind))]
    pub fn finalize_failure(
        &self,
        task_id: &str,
        failure: &Failure,
        session: Option<&SessionLog>,
    ) -> Result<TaskRecord> {
        let session_ref = self.write_session(task_id, session)?;
        let error_ref = RelayPaths::error_log_ref(task_id);
        write_atomic(
            &self.paths.resolve_ref(&error_ref),
            &render_error_log(failure),
        )
        .with_context(|| format!("write error log for {task_id}"))?;
        let record = self.transition(task_id, TransitionCause::Failure, |record| {
            record.error = Some(failure.summary.clone());
            record.failure_kind = Some(failure.kind);
            record.error_log_ref = Some(error_ref);
            if session_ref.is_some() {
                record.session_log_ref = session_ref;
            }
            record.assigned_port = None;
        })?;
        warn!(task_id, kind = ?failure.kind, error = %failure.summary, "task failed");
        Ok(record)
    }

    /// Human approval: back to `pending`, plan kept as execution context.
    pub fn approve(&self, task_id: &str) -> Result<TaskRecord> {
        self.transition(task_id, TransitionCause::Approve, |_| {})
    }

    /// Human revision: feedback appended to the content, plan discarded.
    pub fn revise(&self, task_id: &str, feedback: &str) -> Result<TaskRecord> {
        let feedback = feedback.trim().to_string();
        let record = self.transition(task_id, TransitionCause::Revise, |record| {
            record
                .content
                .push_str(&format!("\n\n## Revision Feedback\n\n{feedback}\n"));
            record.plan_ref = None;
        })?;
        self.discard_sidecar(&RelayPaths::plan_ref(task_id));
        Ok(record)
    }

    /// Human rejection: terminal failure, plan discarded.
    pub fn reject(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.transition(task_id, TransitionCause::Reject, |record| {
            record.plan_ref = None;
            record.error = Some(PLAN_REJECTED_MESSAGE.to_string());
            record.failure_kind = Some(FailureKind::PlanRejected);
        })?;
        self.discard_sidecar(&RelayPaths::plan_ref(task_id));
        Ok(record)
    }

    /// Explicit re-queue of a failed task; clears the recorded failure.
    pub fn requeue(&self, task_id: &str) -> Result<TaskRecord> {
        let record = self.transition(task_id, TransitionCause::Requeue, |record| {
            record.error = None;
            record.failure_kind = None;
            record.error_log_ref = None;
        })?;
        self.discard_sidecar(&RelayPaths::error_log_ref(task_id));
        Ok(record)
    }

    pub fn get(&self, task_id: &str) -> Result<TaskRecord> {
        let book = self.load()?;
        book.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| RelayError::TaskNotFound(task_id.to_string()).into())
    }

    /// Tasks ordered oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let book = self.load()?;
        let mut tasks: Vec<TaskRecord> = book
            .tasks
            .into_values()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .collect();
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Task joined with its sidecars.
    pub fn read(&self, task_id: &str) -> Result<TaskDetail> {
        let record = self.get(task_id)?;
        let plan_content = self.read_sidecar(record.plan_ref.as_deref())?;
        let error_log = self.read_sidecar(record.error_log_ref.as_deref())?;
        let session_log = match self.read_sidecar(record.session_log_ref.as_deref())? {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("parse session log for {task_id}"))?,
            ),
            None => None,
        };
        Ok(TaskDetail {
            branch: branch_name(&record.id),
            record,
            plan_content,
            error_log,
            session_log,
        })
    }

    /// Plan text for a task, if a plan sidecar is linked.
    pub fn plan_content(&self, record: &TaskRecord) -> Result<Option<String>> {
        self.read_sidecar(record.plan_ref.as_deref())
    }

    /// Per-status counts plus a health bit (state directory present).
    pub fn status_report(&self) -> Result<StatusReport> {
        let counts = self.counts()?;
        Ok(StatusReport {
            healthy: self.paths.state_dir().is_dir(),
            total: counts.total(),
            counts,
        })
    }

    pub fn counts(&self) -> Result<StatusCounts> {
        let book = self.load()?;
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|status| (status, 0)).collect();
        for record in book.tasks.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(StatusCounts { counts })
    }

    fn update(
        &self,
        task_id: &str,
        mutate: impl FnOnce(&mut TaskRecord) -> Result<()>,
    ) -> Result<TaskRecord> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let record = book
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RelayError::TaskNotFound(task_id.to_string()))?;
        mutate(record)?;
        record.modified = Utc::now();
        let snapshot = record.clone();
        self.commit(&book, &snapshot)?;
        Ok(snapshot)
    }

    fn commit(&self, book: &TaskBook, changed: &TaskRecord) -> Result<()> {
        let path = self.paths.tasks_path();
        write_json_atomic(&path, book).with_context(|| format!("commit {}", path.display()))?;
        self.mirror(changed);
        Ok(())
    }

    fn mirror(&self, record: &TaskRecord) {
        if let Err(err) = mirror_task(&self.paths, record) {
            warn!(task_id = %record.id, err = %format!("{err:#}"), "mirror update failed");
        }
    }

    fn load(&self) -> Result<TaskBook> {
        load_or_default(&self.paths.tasks_path())
    }

    fn write_session(&self, task_id: &str, session: Option<&SessionLog>) -> Result<Option<String>> {
        let Some(session) = session else {
            return Ok(None);
        };
        let session_ref = RelayPaths::session_log_ref(task_id);
        write_json_atomic(&self.paths.resolve_ref(&session_ref), session)
            .with_context(|| format!("write session log for {task_id}"))?;
        Ok(Some(session_ref))
    }

    fn read_sidecar(&self, reference: Option<&str>) -> Result<Option<String>> {
        let Some(reference) = reference else {
            return Ok(None);
        };
        let path = self.paths.resolve_ref(reference);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn discard_sidecar(&self, reference: &str) {
        if let Err(err) = remove_if_exists(&self.paths.resolve_ref(reference)) {
            warn!(reference, err = %format!("{err:#}"), "failed to remove sidecar");
        }
    }
}

fn fresh_record(id: String, input: NewTask, plan_id: Option<&str>) -> TaskRecord {
    let now = Utc::now();
    TaskRecord {
        id,
        title: input.title,
        content: input.content,
        task_type: input.task_type,
        status: TaskStatus::Pending,
        needs_plan_review: input.needs_plan_review,
        plan_ref: None,
        error: None,
        failure_kind: None,
        error_log_ref: None,
        session_log_ref: None,
        assigned_port: None,
        plan_id: plan_id.map(str::to_string),
        created: now,
        modified: now,
    }
}

fn render_error_log(failure: &Failure) -> String {
    let mut buf = String::new();
    buf.push_str(&format!("kind: {:?}\n", failure.kind));
    buf.push_str(&format!("error: {}\n", failure.summary));
    if !failure.diagnostics.trim().is_empty() {
        buf.push('\n');
        buf.push_str(failure.diagnostics.trim_end());
        buf.push('\n');
    }
    buf
}
