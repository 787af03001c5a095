//! Task status transition rules.
//!
//! Every status write in the store goes through [`check_transition`]; the
//! table below is the whole state machine.

use crate::core::types::TaskStatus;

/// Why a status change is being made. Used for validation and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// A worker took ownership of a pending task.
    Claim,
    /// The planning phase produced a plan.
    PlanReady,
    /// The worker pipeline finished successfully.
    Success,
    /// The worker pipeline failed, or startup recovery found an orphan.
    Failure,
    /// A human approved the plan.
    Approve,
    /// A human asked for a revised plan.
    Revise,
    /// A human rejected the plan.
    Reject,
    /// A human re-queued a failed task.
    Requeue,
}

impl TransitionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionCause::Claim => "claim",
            TransitionCause::PlanReady => "plan_ready",
            TransitionCause::Success => "success",
            TransitionCause::Failure => "failure",
            TransitionCause::Approve => "approve",
            TransitionCause::Revise => "revise",
            TransitionCause::Reject => "reject",
            TransitionCause::Requeue => "requeue",
        }
    }

    /// The `(from, to)` edge this cause is allowed to drive.
    pub fn edge(self) -> (TaskStatus, TaskStatus) {
        match self {
            TransitionCause::Claim => (TaskStatus::Pending, TaskStatus::InProgress),
            TransitionCause::PlanReady => (TaskStatus::InProgress, TaskStatus::PlanReview),
            TransitionCause::Success => (TaskStatus::InProgress, TaskStatus::Completed),
            TransitionCause::Failure => (TaskStatus::InProgress, TaskStatus::Failed),
            TransitionCause::Approve => (TaskStatus::PlanReview, TaskStatus::Pending),
            TransitionCause::Revise => (TaskStatus::PlanReview, TaskStatus::Pending),
            TransitionCause::Reject => (TaskStatus::PlanReview, TaskStatus::Failed),
            TransitionCause::Requeue => (TaskStatus::Failed, TaskStatus::Pending),
        }
    }
}

/// Validate that `cause` may move a task currently in `from`.
///
/// Returns the target status, or an error message naming the offending edge.
pub fn check_transition(from: TaskStatus, cause: TransitionCause) -> Result<TaskStatus, String> {
    let (expected, to) = cause.edge();
    if from != expected {
        return Err(format!(
            "{} requires status {expected} but task is {from}",
            cause.as_str()
        ));
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_only_from_pending() {
        assert_eq!(
            check_transition(TaskStatus::Pending, TransitionCause::Claim),
            Ok(TaskStatus::InProgress)
        );
        for status in [
            TaskStatus::InProgress,
            TaskStatus::PlanReview,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert!(check_transition(status, TransitionCause::Claim).is_err());
        }
    }

    #[test]
    fn terminal_statuses_only_leave_via_requeue() {
        for cause in [
            TransitionCause::Claim,
            TransitionCause::PlanReady,
            TransitionCause::Success,
            TransitionCause::Failure,
            TransitionCause::Approve,
            TransitionCause::Revise,
            TransitionCause::Reject,
            TransitionCause::Requeue,
        ] {
            assert!(check_transition(TaskStatus::Completed, cause).is_err());
        }
        assert_eq!(
            check_transition(TaskStatus::Failed, TransitionCause::Requeue),
            Ok(TaskStatus::Pending)
        );
    }

    #[test]
    fn review_decisions_require_plan_review() {
        let err = check_transition(TaskStatus::Pending, TransitionCause::Reject).unwrap_err();
        assert!(err.contains("reject requires status plan_review"));
        assert_eq!(
            check_transition(TaskStatus::PlanReview, TransitionCause::Reject),
            Ok(TaskStatus::Failed)
        );
    }
}
