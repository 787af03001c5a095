//! Human-facing projection of the record files.
//!
//! One file per task under `.relay/tasks/<status>/` and one per plan under
//! `.relay/plans/<status>/`. Nothing reads these back; stores call in here
//! only after the authoritative write has committed, and every call is safe
//! to repeat.

use std::fs;

use anyhow::{Context, Result};

use crate::core::types::{PlanRecord, PlanStatus, TaskRecord, TaskStatus};
use crate::io::paths::RelayPaths;
use crate::io::records::{remove_if_exists, write_atomic, write_json_atomic};

/// Place the task's mirror file in the directory for its current status and
/// remove it from every other status directory.
pub fn mirror_task(paths: &RelayPaths, record: &TaskRecord) -> Result<()> {
    let target = paths.task_mirror_path(record.status, &record.id);
    write_atomic(&target, &render_task(record))?;
    for status in TaskStatus::ALL {
        if status != record.status {
            remove_if_exists(&paths.task_mirror_path(status, &record.id))?;
        }
    }
    Ok(())
}

pub fn mirror_plan(paths: &RelayPaths, record: &PlanRecord) -> Result<()> {
    let target = paths.plan_mirror_path(record.status, &record.id);
    write_json_atomic(&target, record)?;
    for status in PlanStatus::ALL {
        if status != record.status {
            remove_if_exists(&paths.plan_mirror_path(status, &record.id))?;
        }
    }
    Ok(())
}

/// Status directories that currently hold a mirror file for `task_id`.
pub fn task_mirror_locations(paths: &RelayPaths, task_id: &str) -> Vec<TaskStatus> {
    TaskStatus::ALL
        .into_iter()
        .filter(|status| paths.task_mirror_path(*status, task_id).is_file())
        .collect()
}

/// Make sure every status directory exists so the layout is browsable on a
/// fresh repository.
pub fn ensure_mirror_dirs(paths: &RelayPaths) -> Result<()> {
    for status in TaskStatus::ALL {
        let dir = paths.task_mirror_dir(status);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(())
}

fn render_task(record: &TaskRecord) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", record.id));
    out.push_str(&format!("title: {}\n", record.title));
    out.push_str(&format!("type: {}\n", record.task_type.as_str()));
    out.push_str(&format!("status: {}\n", record.status));
    out.push_str(&format!("needs_plan_review: {}\n", record.needs_plan_review));
    if let Some(port) = record.assigned_port {
        out.push_str(&format!("port: {port}\n"));
    }
    if let Some(error) = &record.error {
        out.push_str(&format!("error: {}\n", error.lines().next().unwrap_or_default()));
    }
    out.push_str(&format!("created: {}\n", record.created.to_rfc3339()));
    out.push_str(&format!("modified: {}\n", record.modified.to_rfc3339()));
    out.push_str("---\n\n");
    out.push_str(record.content.trim_end());
    out.push('\n');
    out
}
