//! `relay` command line.
//!
//! Thin wrapper over the library: every command resolves `.relay/` under the
//! repository root, calls one store or dispatcher operation and prints the
//! resulting records as JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay::coordinator::Coordinator;
use relay::core::types::{NewTask, PlanStatus, TaskStatus, TaskType};
use relay::dispatcher::{Dispatcher, RunMode};
use relay::error::RelayError;
use relay::exit_codes;
use relay::io::config::load_config;
use relay::io::git::Git;
use relay::io::init::{InitOptions, init_relay};
use relay::io::paths::RelayPaths;
use relay::io::plan_store::PlanStore;
use relay::io::store::TaskStore;
use relay::io::verify::ShellVerifier;
use relay::io::workspace::WorkspaceManager;
use relay::logging;
use relay::review::{self, ReviewDecision};
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Run queued tasks through a coding agent in isolated git worktrees"
)]
struct Cli {
    /// Repository root.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.relay/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a new task.
    Add {
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        #[arg(long = "type", default_value = "feature")]
        task_type: TaskType,
        /// Run a read-only planning pass and wait for review first.
        #[arg(long)]
        plan_review: bool,
    },
    /// List tasks, oldest first.
    List { status: Option<TaskStatus> },
    /// Show a task with its plan, error log and session log.
    Show { id: String },
    /// Task counts per status.
    Status,
    /// Dispatch pending tasks until none are left.
    Run {
        /// Keep polling for new tasks until interrupted.
        #[arg(long)]
        watch: bool,
    },
    /// Approve a reviewed plan; the task returns to pending.
    Approve { id: String },
    /// Send a plan back with feedback; the task is re-planned.
    Revise {
        id: String,
        #[arg(long)]
        feedback: String,
    },
    /// Reject a reviewed plan; the task fails.
    Reject { id: String },
    /// Move a failed task back to pending.
    Requeue { id: String },
    /// Worktrees currently held by tasks.
    Worktrees,
    /// Recent commits on the integration branch.
    Log {
        /// Revision to list from; defaults to the integration branch.
        rev: Option<String>,
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    #[command(subcommand)]
    Plan(PlanCommand),
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Create a draft plan from a JSON content file.
    Create {
        title: String,
        /// JSON file holding `{"tasks": [{"title": ..., "content": ..., "task_type": ...}]}`.
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        summary: String,
    },
    List { status: Option<PlanStatus> },
    /// Mark a draft plan ready.
    Ready { id: String },
    /// Create one pending task per candidate.
    Execute { id: String },
    /// Re-derive a plan's status from its tasks.
    Refresh { id: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve {}", cli.root.display()))?;
    let paths = RelayPaths::new(&root);
    match cli.command {
        Command::Init { force } => {
            let paths = init_relay(&root, &InitOptions { force })?;
            println!("initialized {}", paths.relay_dir().display());
            Ok(())
        }
        Command::Add {
            title,
            content,
            task_type,
            plan_review,
        } => print_json(&tasks(&paths).create(NewTask {
            title,
            content,
            task_type,
            needs_plan_review: plan_review,
        })?),
        Command::List { status } => print_json(&tasks(&paths).list(status)?),
        Command::Show { id } => print_json(&tasks(&paths).read(&id)?),
        Command::Status => print_json(&tasks(&paths).status_report()?),
        Command::Run { watch } => cmd_run(paths, watch),
        Command::Approve { id } => {
            print_json(&review::decide(&tasks(&paths), &id, ReviewDecision::Approve)?)
        }
        Command::Revise { id, feedback } => print_json(&review::decide(
            &tasks(&paths),
            &id,
            ReviewDecision::Revise { feedback },
        )?),
        Command::Reject { id } => {
            print_json(&review::decide(&tasks(&paths), &id, ReviewDecision::Reject)?)
        }
        Command::Requeue { id } => print_json(&review::requeue(&tasks(&paths), &id)?),
        Command::Worktrees => cmd_worktrees(paths),
        Command::Log { rev, limit } => cmd_log(&paths, rev, limit),
        Command::Plan(command) => cmd_plan(&paths, command),
    }
}

fn tasks(paths: &RelayPaths) -> TaskStore {
    TaskStore::open(paths.clone())
}

fn cmd_run(paths: RelayPaths, watch: bool) -> Result<()> {
    let config = load_config(&paths.config_path())?;
    let dispatcher = Dispatcher::new(paths, config, Arc::new(ShellVerifier));
    let recovered = dispatcher.recover()?;
    if !recovered.interrupted.is_empty() {
        eprintln!(
            "marked {} interrupted task(s) failed: {}",
            recovered.interrupted.len(),
            recovered.interrupted.join(", ")
        );
    }

    let stopper = dispatcher.stopper();
    ctrlc::set_handler(move || stopper.stop()).context("install Ctrl-C handler")?;

    let mode = if watch { RunMode::Watch } else { RunMode::Drain };
    let summary = dispatcher.run(mode)?;
    println!(
        "dispatched {} task(s): {} completed, {} failed, {} awaiting plan review",
        summary.dispatched, summary.completed, summary.failed, summary.plan_review
    );
    Ok(())
}

fn cmd_worktrees(paths: RelayPaths) -> Result<()> {
    let config = load_config(&paths.config_path())?;
    let coordinator = Arc::new(Coordinator::new(&config));
    let workspaces = WorkspaceManager::new(paths, &config, coordinator);
    for entry in workspaces.list()? {
        println!(
            "{}\t{}\t{}",
            entry.path.display(),
            entry.branch.as_deref().unwrap_or("(detached)"),
            entry.head.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_log(paths: &RelayPaths, rev: Option<String>, limit: usize) -> Result<()> {
    let config = load_config(&paths.config_path())?;
    let rev = rev.unwrap_or_else(|| config.integration_branch.clone());
    let git = Git::new(paths.root(), config.git_timeout());
    print_json(&git.log(&rev, limit)?)
}

fn cmd_plan(paths: &RelayPaths, command: PlanCommand) -> Result<()> {
    let plans = PlanStore::open(paths.clone());
    match command {
        PlanCommand::Create {
            title,
            file,
            summary,
        } => {
            let content = read_json(&file)?;
            print_json(&plans.create(&title, &summary, content)?)
        }
        PlanCommand::List { status } => print_json(&plans.list(status)?),
        PlanCommand::Ready { id } => print_json(&plans.mark_ready(&id)?),
        PlanCommand::Execute { id } => print_json(&plans.execute(&id, &tasks(paths))?),
        PlanCommand::Refresh { id } => print_json(&plans.refresh(&id, &tasks(paths))?),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RelayError>() {
        Some(RelayError::TaskNotFound(_) | RelayError::PlanNotFound(_)) => exit_codes::NOT_FOUND,
        Some(RelayError::ClaimConflict { .. } | RelayError::InvalidTransition { .. }) => {
            exit_codes::CONFLICT
        }
        _ => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["relay", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_add_with_type_and_review() {
        let cli = Cli::parse_from([
            "relay",
            "-C",
            "/tmp/repo",
            "add",
            "Fix login",
            "--type",
            "bugfix",
            "--plan-review",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/repo"));
        match cli.command {
            Command::Add {
                title,
                task_type,
                plan_review,
                ..
            } => {
                assert_eq!(title, "Fix login");
                assert_eq!(task_type, TaskType::Bugfix);
                assert!(plan_review);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn parse_list_status_filter() {
        let cli = Cli::parse_from(["relay", "list", "plan_review"]);
        assert!(matches!(
            cli.command,
            Command::List {
                status: Some(TaskStatus::PlanReview)
            }
        ));
        assert!(Cli::try_parse_from(["relay", "list", "running"]).is_err());
    }

    #[test]
    fn parse_revise_requires_feedback() {
        assert!(Cli::try_parse_from(["relay", "revise", "ab12cd34"]).is_err());
        let cli = Cli::parse_from(["relay", "revise", "ab12cd34", "--feedback", "smaller"]);
        assert!(matches!(cli.command, Command::Revise { .. }));
    }

    #[test]
    fn parse_log_defaults_to_integration_branch() {
        let cli = Cli::parse_from(["relay", "log"]);
        assert!(matches!(
            cli.command,
            Command::Log {
                rev: None,
                limit: 10
            }
        ));
        let cli = Cli::parse_from(["relay", "log", "task/ab12cd34", "-n", "3"]);
        match cli.command {
            Command::Log { rev, limit } => {
                assert_eq!(rev.as_deref(), Some("task/ab12cd34"));
                assert_eq!(limit, 3);
            }
            _ => panic!("expected log"),
        }
    }

    #[test]
    fn errors_map_to_stable_exit_codes() {
        let not_found = anyhow::Error::from(RelayError::TaskNotFound("x".to_string()));
        assert_eq!(exit_code(&not_found), exit_codes::NOT_FOUND);
        let conflict = anyhow::Error::from(RelayError::InvalidTransition {
            task_id: "x".to_string(),
            reason: "approve requires status plan_review but task is pending".to_string(),
        })
        .context("approve x");
        assert_eq!(exit_code(&conflict), exit_codes::CONFLICT);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), exit_codes::INVALID);
    }
}
