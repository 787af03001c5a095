//! Human decisions on tasks waiting in `plan_review`, and explicit re-queue.
//!
//! Decisions arrive from outside the poll loop and never occupy a worker
//! slot; a reviewed task simply re-enters `pending` (or fails) and the next
//! tick picks it up.

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::types::TaskRecord;
use crate::io::store::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Execute with the plan as context.
    Approve,
    /// Re-plan with this feedback appended to the task content.
    Revise { feedback: String },
    /// Fail the task without ever allocating a workspace.
    Reject,
}

impl ReviewDecision {
    fn name(&self) -> &'static str {
        match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Revise { .. } => "revise",
            ReviewDecision::Reject => "reject",
        }
    }
}

#[instrument(skip_all, fields(task_id = %task_id, decision = decision.name()))]
pub fn decide(store: &TaskStore, task_id: &str, decision: ReviewDecision) -> Result<TaskRecord> {
    let record = match decision {
        ReviewDecision::Approve => store.approve(task_id)?,
        ReviewDecision::Revise { feedback } => {
            if feedback.trim().is_empty() {
                return Err(anyhow!("revision feedback must not be empty"));
            }
            store.revise(task_id, &feedback)?
        }
        ReviewDecision::Reject => store.reject(task_id)?,
    };
    info!(status = %record.status, "review decision applied");
    Ok(record)
}

/// Move a failed task back to `pending`. Never done automatically.
#[instrument(skip_all, fields(task_id = %task_id))]
pub fn requeue(store: &TaskStore, task_id: &str) -> Result<TaskRecord> {
    let record = store.requeue(task_id)?;
    info!("task re-queued");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{NewTask, TaskStatus};
    use crate::error::RelayError;
    use crate::io::paths::RelayPaths;

    fn reviewed_task() -> (tempfile::TempDir, TaskStore, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = TaskStore::open(RelayPaths::new(temp.path()));
        let task = store
            .create(NewTask {
                title: "Cache lookups".to_string(),
                content: "Add an LRU in front of the resolver.".to_string(),
                needs_plan_review: true,
                ..NewTask::default()
            })
            .expect("create");
        store.claim(&task.id).expect("claim");
        store
            .enter_plan_review(&task.id, "1. add lru crate\n2. wrap resolver")
            .expect("plan");
        (temp, store, task.id)
    }

    #[test]
    fn approve_keeps_plan_for_execution() {
        let (_temp, store, id) = reviewed_task();
        let record = decide(&store, &id, ReviewDecision::Approve).expect("approve");
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(!record.needs_planning());
        assert_eq!(
            store.plan_content(&record).expect("read").as_deref(),
            Some("1. add lru crate\n2. wrap resolver\n")
        );
    }

    #[test]
    fn revise_requires_feedback_and_replans() {
        let (_temp, store, id) = reviewed_task();
        let empty = ReviewDecision::Revise {
            feedback: "  ".to_string(),
        };
        assert!(decide(&store, &id, empty).is_err());
        assert_eq!(store.get(&id).expect("get").status, TaskStatus::PlanReview);

        let record = decide(
            &store,
            &id,
            ReviewDecision::Revise {
                feedback: "Bound the cache at 1k entries.".to_string(),
            },
        )
        .expect("revise");
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.needs_planning());
        assert!(
            record
                .content
                .ends_with("## Revision Feedback\n\nBound the cache at 1k entries.\n")
        );
    }

    #[test]
    fn requeue_only_from_failed() {
        let (_temp, store, id) = reviewed_task();
        let err = requeue(&store, &id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::InvalidTransition { .. })
        ));
        decide(&store, &id, ReviewDecision::Reject).expect("reject");
        let record = requeue(&store, &id).expect("requeue");
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.error.is_none());
    }
}
