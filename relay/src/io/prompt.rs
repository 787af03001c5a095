//! Agent prompts rendered from embedded templates.
//!
//! The prompt travels as a single argv element, so the rendered text is held
//! under a byte budget: droppable sections (the approved plan) are truncated
//! before anything required is touched.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::ids::branch_name;
use crate::core::types::TaskRecord;

const EXECUTE_TEMPLATE: &str = include_str!("prompts/execute.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// Below the per-argument limit of common kernels.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 96 * 1024;

const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section pattern should be valid")
});

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("execute", EXECUTE_TEMPLATE)
            .context("load execute template")?;
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .with_context(|| format!("render {name} prompt"))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

/// Truncate droppable sections, last first, until the total fits.
fn apply_budget(sections: &mut [Section], budget: usize) {
    let total = |secs: &[Section]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    for idx in (0..sections.len()).rev() {
        let over = total(sections).saturating_sub(budget);
        if over == 0 {
            return;
        }
        let section = &mut sections[idx];
        if section.required {
            continue;
        }
        let before = section.content.len();
        let keep = before.saturating_sub(over + TRUNCATION_MARKER.len());
        let mut cut = keep;
        while !section.content.is_char_boundary(cut) {
            cut -= 1;
        }
        section.content.truncate(cut);
        section.content.push_str(TRUNCATION_MARKER);
        debug!(
            section = %section.key,
            before,
            after = section.content.len(),
            "truncated prompt section"
        );
    }
}

fn assemble(rendered: &str, budget: usize) -> String {
    let mut sections = parse_sections(rendered);
    apply_budget(&mut sections, budget);
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds agent prompts for a task.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Implementation prompt, carrying the approved plan when there is one.
    pub fn execute(
        &self,
        task: &TaskRecord,
        plan: Option<&str>,
        port: Option<u16>,
    ) -> Result<String> {
        let rendered = PromptEngine::new()?.render(
            "execute",
            context! {
                task => task,
                branch => branch_name(&task.id),
                plan => plan.map(str::trim).filter(|p| !p.is_empty()),
                port => port,
            },
        )?;
        Ok(assemble(&rendered, self.budget_bytes))
    }

    /// Read-only planning prompt.
    pub fn plan(&self, task: &TaskRecord) -> Result<String> {
        let rendered = PromptEngine::new()?.render("plan", context! { task => task })?;
        Ok(assemble(&rendered, self.budget_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TaskStatus, TaskType};

    fn task() -> TaskRecord {
        let now = chrono::Utc::now();
        TaskRecord {
            id: "ab12cd34".to_string(),
            title: "Add retry header".to_string(),
            content: "Send Retry-After on 429 responses.".to_string(),
            task_type: TaskType::Bugfix,
            status: TaskStatus::InProgress,
            needs_plan_review: false,
            plan_ref: None,
            error: None,
            failure_kind: None,
            error_log_ref: None,
            session_log_ref: None,
            assigned_port: None,
            plan_id: None,
            created: now,
            modified: now,
        }
    }

    #[test]
    fn execute_prompt_carries_task_plan_and_convention() {
        let prompt = PromptBuilder::default()
            .execute(&task(), Some("1. edit handler\n2. add test"), Some(9201))
            .expect("render");
        assert!(prompt.contains("Add retry header"));
        assert!(prompt.contains("Send Retry-After"));
        assert!(prompt.contains("(bugfix)"));
        assert!(prompt.contains("feat(ab12cd34): <summary>"));
        assert!(prompt.contains("task/ab12cd34"));
        assert!(prompt.contains("`9201`"));
        assert!(prompt.contains("### Approved Plan"));
        assert!(!prompt.contains("<!--"));

        let bare = PromptBuilder::default()
            .execute(&task(), None, None)
            .expect("render");
        assert!(!bare.contains("Approved Plan"));
        assert!(!bare.contains("TASK_PORT"));
    }

    #[test]
    fn plan_prompt_forbids_modification() {
        let prompt = PromptBuilder::default().plan(&task()).expect("render");
        assert!(prompt.contains("Do not modify any files. Output only analysis and a plan."));
        assert!(prompt.contains("Send Retry-After"));
    }

    /// Verifies an oversized plan is truncated while required sections stay whole.
    #[test]
    fn budget_truncates_plan_only() {
        let plan = "step ".repeat(2_000);
        let prompt = PromptBuilder::new(2_000)
            .execute(&task(), Some(&plan), None)
            .expect("render");
        assert!(prompt.len() <= 2_000 + TRUNCATION_MARKER.len());
        assert!(prompt.contains("### Agent Contract"));
        assert!(prompt.contains("Send Retry-After"));
        assert!(prompt.ends_with("[truncated]"));
    }
}
