//! Filesystem layout under `.relay/`.

use std::path::{Path, PathBuf};

use crate::core::types::{PlanStatus, TaskStatus};

/// Name of the state directory at the repository root.
pub const RELAY_DIR: &str = ".relay";

/// Resolved paths for one repository.
#[derive(Debug, Clone)]
pub struct RelayPaths {
    root: PathBuf,
    relay_dir: PathBuf,
}

impl RelayPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let relay_dir = root.join(RELAY_DIR);
        Self { root, relay_dir }
    }

    /// Repository root (the integration branch checkout).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relay_dir(&self) -> &Path {
        &self.relay_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.relay_dir.join("config.toml")
    }

    pub fn gitignore_path(&self) -> PathBuf {
        self.relay_dir.join(".gitignore")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.relay_dir.join("state")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.state_dir().join("tasks.json")
    }

    pub fn plans_path(&self) -> PathBuf {
        self.state_dir().join("plans.json")
    }

    pub fn sidecar_dir(&self) -> PathBuf {
        self.state_dir().join("sidecars")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir().join("sessions")
    }

    /// Relative sidecar references stored in task records.
    pub fn plan_ref(task_id: &str) -> String {
        format!("state/sidecars/{task_id}.plan.md")
    }

    pub fn error_log_ref(task_id: &str) -> String {
        format!("state/sidecars/{task_id}.error.log")
    }

    pub fn session_log_ref(task_id: &str) -> String {
        format!("state/sessions/{task_id}.session.json")
    }

    /// Resolve a reference stored in a record to an absolute path.
    pub fn resolve_ref(&self, reference: &str) -> PathBuf {
        self.relay_dir.join(reference)
    }

    pub fn task_mirror_dir(&self, status: TaskStatus) -> PathBuf {
        self.relay_dir.join("tasks").join(status.as_str())
    }

    pub fn task_mirror_path(&self, status: TaskStatus, task_id: &str) -> PathBuf {
        self.task_mirror_dir(status).join(format!("{task_id}.md"))
    }

    pub fn plan_mirror_path(&self, status: PlanStatus, plan_id: &str) -> PathBuf {
        self.relay_dir
            .join("plans")
            .join(status.as_str())
            .join(format!("{plan_id}.json"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.relay_dir.join("worktrees")
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktrees_dir().join(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let paths = RelayPaths::new("/repo");
        assert_eq!(paths.tasks_path(), Path::new("/repo/.relay/state/tasks.json"));
        assert_eq!(
            paths.task_mirror_path(TaskStatus::PlanReview, "abc"),
            Path::new("/repo/.relay/tasks/plan_review/abc.md")
        );
        assert_eq!(
            paths.resolve_ref(&RelayPaths::plan_ref("abc")),
            Path::new("/repo/.relay/state/sidecars/abc.plan.md")
        );
        assert_eq!(
            paths.worktree_path("abc"),
            Path::new("/repo/.relay/worktrees/abc")
        );
    }
}
