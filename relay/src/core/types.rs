//! Shared record types for tasks and plans.
//!
//! These are the JSON shapes persisted in `.relay/state/` and returned to
//! callers. They carry no behavior beyond small derived views.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status of a task. Also names the mirror directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PlanReview,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::PlanReview,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::PlanReview => "plan_review",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown task status '{s}'"))
    }
}

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    Chore,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Feature => "feature",
            TaskType::Bugfix => "bugfix",
            TaskType::Refactor => "refactor",
            TaskType::Test => "test",
            TaskType::Docs => "docs",
            TaskType::Chore => "chore",
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(TaskType::Feature),
            "bugfix" => Ok(TaskType::Bugfix),
            "refactor" => Ok(TaskType::Refactor),
            "test" => Ok(TaskType::Test),
            "docs" => Ok(TaskType::Docs),
            "chore" => Ok(TaskType::Chore),
            other => Err(anyhow!("unknown task type '{other}'")),
        }
    }
}

// Records written by older tooling may carry types outside the closed set.
impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}

/// Category of a recorded failure, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Workspace,
    ProcessTimeout,
    ProcessCrash,
    Cancelled,
    MergeConflict,
    VerificationFailure,
    PushConflict,
    MergeRetriesExhausted,
    PlanExtraction,
    PlanRejected,
    Interrupted,
    Internal,
}

/// A recorded task failure: a one-line summary plus the full diagnostics
/// that go to the error-log sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub summary: String,
    pub diagnostics: String,
}

/// Authoritative task record (one entry in `.relay/state/tasks.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub needs_plan_review: bool,
    /// Relative path of the plan sidecar, present once a plan was produced.
    #[serde(default)]
    pub plan_ref: Option<String>,
    /// One-line failure summary.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub error_log_ref: Option<String>,
    #[serde(default)]
    pub session_log_ref: Option<String>,
    #[serde(default)]
    pub assigned_port: Option<u16>,
    /// Plan this task was created from, if any.
    #[serde(default)]
    pub plan_id: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl TaskRecord {
    pub fn has_plan(&self) -> bool {
        self.plan_ref.is_some()
    }

    /// True when the next dispatch should run the planning phase.
    pub fn needs_planning(&self) -> bool {
        self.needs_plan_review && !self.has_plan()
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub content: String,
    pub task_type: TaskType,
    pub needs_plan_review: bool,
}

/// Task record joined with its sidecar artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub record: TaskRecord,
    pub branch: String,
    pub plan_content: Option<String>,
    pub error_log: Option<String>,
    pub session_log: Option<serde_json::Value>,
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub counts: BTreeMap<TaskStatus, usize>,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Ready,
    Executing,
    Done,
    Failed,
}

impl PlanStatus {
    pub const ALL: [PlanStatus; 5] = [
        PlanStatus::Draft,
        PlanStatus::Ready,
        PlanStatus::Executing,
        PlanStatus::Done,
        PlanStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Ready => "ready",
            PlanStatus::Executing => "executing",
            PlanStatus::Done => "done",
            PlanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown plan status '{s}'"))
    }
}

/// Authoritative plan record (one entry in `.relay/state/plans.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    /// Opaque blob; must hold `{"tasks": [{title, content?, task_type?}]}` to execute.
    pub content: serde_json::Value,
    pub status: PlanStatus,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// One candidate sub-task inside a plan's content blob.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanCandidate {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub task_type: TaskType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().expect("parse"), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn unknown_task_type_falls_back_to_feature() {
        let parsed: TaskType = serde_json::from_str("\"experiment\"").expect("parse");
        assert_eq!(parsed, TaskType::Feature);
        let parsed: TaskType = serde_json::from_str("\"docs\"").expect("parse");
        assert_eq!(parsed, TaskType::Docs);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::PlanReview).expect("serialize");
        assert_eq!(json, "\"plan_review\"");
    }
}
