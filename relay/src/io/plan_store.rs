//! Authoritative plan store (`.relay/state/plans.json`).
//!
//! Same discipline as the task store: one locked read-modify-write per
//! mutation, mirror updated after the commit. Executing a plan takes the
//! plan lock first and the task lock second, never the reverse.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::ids::new_id;
use crate::core::types::{NewTask, PlanCandidate, PlanRecord, PlanStatus, TaskStatus};
use crate::error::RelayError;
use crate::io::mirror::mirror_plan;
use crate::io::paths::RelayPaths;
use crate::io::records::{RecordLock, load_or_default, write_json_atomic};
use crate::io::store::TaskStore;

const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/plan/v1.schema.json"
));

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanBook {
    #[serde(default)]
    plans: BTreeMap<String, PlanRecord>,
}

#[derive(Debug)]
pub struct PlanStore {
    paths: RelayPaths,
    lock: RecordLock,
}

impl PlanStore {
    pub fn open(paths: RelayPaths) -> Self {
        let lock = RecordLock::new(&paths.plans_path());
        Self { paths, lock }
    }

    #[instrument(skip_all, fields(title = %title))]
    pub fn create(&self, title: &str, summary: &str, content: Value) -> Result<PlanRecord> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let mut id = new_id();
        while book.plans.contains_key(&id) {
            id = new_id();
        }
        let now = Utc::now();
        let record = PlanRecord {
            id: id.clone(),
            title: title.to_string(),
            summary: summary.to_string(),
            content,
            status: PlanStatus::Draft,
            task_ids: Vec::new(),
            error: None,
            created: now,
            modified: now,
        };
        book.plans.insert(id.clone(), record.clone());
        self.commit(&book, &record)?;
        info!(plan_id = %id, "plan created");
        Ok(record)
    }

    pub fn mark_ready(&self, plan_id: &str) -> Result<PlanRecord> {
        self.update(plan_id, |record| {
            require_status(record, &[PlanStatus::Draft])?;
            record.status = PlanStatus::Ready;
            Ok(())
        })
    }

    /// Validate the content blob and create one pending task per candidate.
    ///
    /// Invalid content moves the plan to `failed` and returns `InvalidPlan`.
    #[instrument(skip_all, fields(plan_id = %plan_id))]
    pub fn execute(&self, plan_id: &str, tasks: &TaskStore) -> Result<PlanRecord> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let record = book
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| RelayError::PlanNotFound(plan_id.to_string()))?;
        require_status(record, &[PlanStatus::Draft, PlanStatus::Ready])?;

        let candidates = match parse_candidates(&record.content) {
            Ok(candidates) => candidates,
            Err(reason) => {
                warn!(reason = %reason, "plan content invalid");
                record.status = PlanStatus::Failed;
                record.error = Some(reason.clone());
                record.modified = Utc::now();
                let snapshot = record.clone();
                self.commit(&book, &snapshot)?;
                return Err(RelayError::InvalidPlan {
                    plan_id: plan_id.to_string(),
                    reason,
                }
                .into());
            }
        };

        let inputs = candidates
            .into_iter()
            .map(|candidate| NewTask {
                title: candidate.title,
                content: candidate.content,
                task_type: candidate.task_type,
                needs_plan_review: false,
            })
            .collect();
        let created = tasks.create_many(inputs, plan_id)?;

        record.task_ids = created.into_iter().map(|task| task.id).collect();
        record.status = PlanStatus::Executing;
        record.error = None;
        record.modified = Utc::now();
        let snapshot = record.clone();
        self.commit(&book, &snapshot)?;
        info!(tasks = snapshot.task_ids.len(), "plan executing");
        Ok(snapshot)
    }

    /// Derive `done`/`failed` for an executing plan from its linked tasks.
    pub fn refresh(&self, plan_id: &str, tasks: &TaskStore) -> Result<PlanRecord> {
        self.update(plan_id, |record| {
            if record.status != PlanStatus::Executing {
                return Ok(());
            }
            let mut statuses = Vec::with_capacity(record.task_ids.len());
            for task_id in &record.task_ids {
                statuses.push(tasks.get(task_id)?.status);
            }
            let failed = statuses
                .iter()
                .filter(|status| **status == TaskStatus::Failed)
                .count();
            if statuses.iter().all(|status| *status == TaskStatus::Completed) {
                record.status = PlanStatus::Done;
            } else if statuses.iter().all(|status| status.is_terminal()) && failed > 0 {
                record.status = PlanStatus::Failed;
                record.error = Some(format!("{failed} of {} tasks failed", statuses.len()));
            }
            Ok(())
        })
    }

    pub fn get(&self, plan_id: &str) -> Result<PlanRecord> {
        self.load()?
            .plans
            .remove(plan_id)
            .ok_or_else(|| RelayError::PlanNotFound(plan_id.to_string()).into())
    }

    pub fn list(&self, status: Option<PlanStatus>) -> Result<Vec<PlanRecord>> {
        let mut plans: Vec<PlanRecord> = self
            .load()?
            .plans
            .into_values()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .collect();
        plans.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    fn update(
        &self,
        plan_id: &str,
        mutate: impl FnOnce(&mut PlanRecord) -> Result<()>,
    ) -> Result<PlanRecord> {
        let _guard = self.lock.acquire()?;
        let mut book = self.load()?;
        let record = book
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| RelayError::PlanNotFound(plan_id.to_string()))?;
        mutate(record)?;
        record.modified = Utc::now();
        let snapshot = record.clone();
        self.commit(&book, &snapshot)?;
        Ok(snapshot)
    }

    fn commit(&self, book: &PlanBook, changed: &PlanRecord) -> Result<()> {
        let path = self.paths.plans_path();
        write_json_atomic(&path, book).with_context(|| format!("commit {}", path.display()))?;
        if let Err(err) = mirror_plan(&self.paths, changed) {
            warn!(plan_id = %changed.id, err = %format!("{err:#}"), "plan mirror update failed");
        }
        Ok(())
    }

    fn load(&self) -> Result<PlanBook> {
        load_or_default(&self.paths.plans_path())
    }
}

fn require_status(record: &PlanRecord, allowed: &[PlanStatus]) -> Result<()> {
    if allowed.contains(&record.status) {
        return Ok(());
    }
    Err(RelayError::InvalidPlan {
        plan_id: record.id.clone(),
        reason: format!("operation not allowed while plan is {}", record.status),
    }
    .into())
}

/// Schema check plus typed decode; the error string goes on the record.
fn parse_candidates(content: &Value) -> std::result::Result<Vec<PlanCandidate>, String> {
    validate_content(content).map_err(|err| format!("{err:#}"))?;
    let tasks = content
        .get("tasks")
        .cloned()
        .ok_or_else(|| "content has no tasks array".to_string())?;
    serde_json::from_value(tasks).map_err(|err| format!("decode plan tasks: {err}"))
}

fn validate_content(content: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile plan schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(content)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("schema validation failed:\n- {}", messages.join("\n- ")));
    }
    Ok(())
}
