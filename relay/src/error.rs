//! Typed failure taxonomy.
//!
//! Component functions return `anyhow::Result`; when a failure has a
//! meaning the caller acts on (retry, finalize as a specific kind), the root
//! cause is a [`RelayError`] recoverable with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::{Failure, FailureKind, TaskStatus};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("task {task_id} is already claimed (status {status})")]
    ClaimConflict { task_id: String, status: TaskStatus },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("invalid transition for {task_id}: {reason}")]
    InvalidTransition { task_id: String, reason: String },

    #[error("workspace error for {task_id}: {message}")]
    WorkspaceError {
        task_id: String,
        message: String,
        diagnostics: String,
    },

    #[error("agent timed out after {0:?}")]
    ProcessTimeout(Duration),

    #[error("agent exited unsuccessfully ({outcome})")]
    ProcessCrash { outcome: String, stderr: String },

    #[error("agent cancelled by shutdown")]
    Cancelled,

    #[error("merge conflict integrating {branch}")]
    MergeConflict { branch: String, details: String },

    #[error("verification failed for {branch}")]
    VerificationFailure { branch: String, output: String },

    #[error("push rejected for {branch}")]
    PushConflict { branch: String, stderr: String },

    #[error("integration of {branch} failed after {attempts} attempts: {last}")]
    MergeRetriesExhausted {
        branch: String,
        attempts: u32,
        last: String,
        diagnostics: String,
    },

    #[error("planning produced no plan text")]
    PlanExtractionFailure,

    #[error("invalid plan {plan_id}: {reason}")]
    InvalidPlan { plan_id: String, reason: String },
}

impl RelayError {
    /// Failures the merge pipeline retries within its attempt budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::VerificationFailure { .. } | RelayError::PushConflict { .. }
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RelayError::WorkspaceError { .. } => FailureKind::Workspace,
            RelayError::ProcessTimeout(_) => FailureKind::ProcessTimeout,
            RelayError::ProcessCrash { .. } => FailureKind::ProcessCrash,
            RelayError::Cancelled => FailureKind::Cancelled,
            RelayError::MergeConflict { .. } => FailureKind::MergeConflict,
            RelayError::VerificationFailure { .. } => FailureKind::VerificationFailure,
            RelayError::PushConflict { .. } => FailureKind::PushConflict,
            RelayError::MergeRetriesExhausted { .. } => FailureKind::MergeRetriesExhausted,
            RelayError::PlanExtractionFailure => FailureKind::PlanExtraction,
            RelayError::ClaimConflict { .. }
            | RelayError::TaskNotFound(_)
            | RelayError::PlanNotFound(_)
            | RelayError::InvalidTransition { .. }
            | RelayError::InvalidPlan { .. } => FailureKind::Internal,
        }
    }

    /// Captured subprocess output or conflict details, if any.
    pub fn diagnostics(&self) -> &str {
        match self {
            RelayError::WorkspaceError { diagnostics, .. } => diagnostics,
            RelayError::ProcessCrash { stderr, .. } => stderr,
            RelayError::MergeConflict { details, .. } => details,
            RelayError::VerificationFailure { output, .. } => output,
            RelayError::PushConflict { stderr, .. } => stderr,
            RelayError::MergeRetriesExhausted { diagnostics, .. } => diagnostics,
            _ => "",
        }
    }
}

/// Convert any pipeline error into a failure record for the store.
pub fn failure_from_error(err: &anyhow::Error) -> Failure {
    let summary = format!("{err:#}");
    match err.downcast_ref::<RelayError>() {
        Some(relay) => Failure {
            kind: relay.failure_kind(),
            summary,
            diagnostics: relay.diagnostics().to_string(),
        },
        None => Failure {
            kind: FailureKind::Internal,
            summary,
            diagnostics: String::new(),
        },
    }
}
