//! Plan review gate and multi-task plans, end to end through the dispatcher.

use relay::core::types::{FailureKind, NewTask, PlanStatus, TaskStatus, TaskType};
use relay::dispatcher::{Dispatcher, RunMode};
use relay::error::RelayError;
use relay::io::plan_store::PlanStore;
use relay::review::{self, ReviewDecision};
use relay::test_support::{COMMITTING_AGENT, ScriptedVerifier, TestRepo};
use serde_json::json;

fn setup() -> (TestRepo, Dispatcher) {
    let repo = TestRepo::new().expect("repo");
    repo.init_relay().expect("init");
    let agent = repo
        .write_script("agent.sh", COMMITTING_AGENT)
        .expect("agent");
    let dispatcher = repo.dispatcher(repo.config(&agent), ScriptedVerifier::passing());
    (repo, dispatcher)
}

fn reviewed_task(title: &str) -> NewTask {
    NewTask {
        title: title.to_string(),
        content: "add a marker file".to_string(),
        task_type: TaskType::Feature,
        needs_plan_review: true,
    }
}

#[test]
fn planning_pass_waits_for_review_without_touching_the_repo() {
    let (repo, dispatcher) = setup();
    let created = dispatcher.store().create(reviewed_task("gated")).expect("create");
    let before = repo.git().rev_parse("main").expect("tip");

    let summary = dispatcher.run(RunMode::Drain).expect("run");
    assert_eq!(summary.plan_review, 1);

    let detail = dispatcher.store().read(&created.id).expect("read");
    assert_eq!(detail.record.status, TaskStatus::PlanReview);
    assert_eq!(detail.record.assigned_port, None);
    let plan = detail.plan_content.expect("plan sidecar");
    assert!(plan.contains("add the marker file"), "{plan}");
    assert!(plan.contains("commit it"), "{plan}");

    assert_eq!(repo.git().rev_parse("main").expect("tip"), before);
    assert!(!repo.paths().worktree_path(&created.id).exists());
    assert!(repo.git().is_clean().expect("status"));
}

#[test]
fn approved_plan_is_executed_with_the_plan_kept() {
    let (repo, dispatcher) = setup();
    let created = dispatcher.store().create(reviewed_task("approved")).expect("create");
    dispatcher.run(RunMode::Drain).expect("plan");

    let approved = review::decide(dispatcher.store(), &created.id, ReviewDecision::Approve)
        .expect("approve");
    assert_eq!(approved.status, TaskStatus::Pending);
    assert!(approved.plan_ref.is_some());

    let summary = dispatcher.run(RunMode::Drain).expect("execute");
    assert_eq!(summary.completed, 1);
    assert!(repo.path().join(format!("task-{}.txt", created.id)).is_file());
}

#[test]
fn rejected_plan_fails_without_workspace_port_or_sidecar() {
    let (repo, dispatcher) = setup();
    let created = dispatcher.store().create(reviewed_task("rejected")).expect("create");
    dispatcher.run(RunMode::Drain).expect("plan");

    let rejected = review::decide(dispatcher.store(), &created.id, ReviewDecision::Reject)
        .expect("reject");
    assert_eq!(rejected.status, TaskStatus::Failed);
    assert_eq!(rejected.failure_kind, Some(FailureKind::PlanRejected));
    assert_eq!(rejected.assigned_port, None);

    let detail = dispatcher.store().read(&created.id).expect("read");
    assert_eq!(detail.plan_content, None);
    assert!(
        !repo
            .paths()
            .resolve_ref(&relay::io::paths::RelayPaths::plan_ref(&created.id))
            .exists()
    );
    assert!(!repo.paths().worktree_path(&created.id).exists());

    // A failed task is only picked up again after an explicit requeue.
    assert_eq!(dispatcher.run(RunMode::Drain).expect("idle").dispatched, 0);
    let requeued = review::requeue(dispatcher.store(), &created.id).expect("requeue");
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.error, None);
}

#[test]
fn revised_plan_is_planned_again_with_feedback() {
    let (_repo, dispatcher) = setup();
    let created = dispatcher.store().create(reviewed_task("revised")).expect("create");
    dispatcher.run(RunMode::Drain).expect("plan");

    let revised = review::decide(
        dispatcher.store(),
        &created.id,
        ReviewDecision::Revise {
            feedback: "split the change in two".to_string(),
        },
    )
    .expect("revise");
    assert_eq!(revised.status, TaskStatus::Pending);
    assert_eq!(revised.plan_ref, None);
    assert!(revised.content.contains("split the change in two"));

    let summary = dispatcher.run(RunMode::Drain).expect("replan");
    assert_eq!(summary.plan_review, 1);
    assert_eq!(
        dispatcher.store().get(&created.id).expect("get").status,
        TaskStatus::PlanReview
    );
}

#[test]
fn review_decisions_require_plan_review_status() {
    let (_repo, dispatcher) = setup();
    let created = dispatcher.store().create(reviewed_task("early")).expect("create");

    let err = review::decide(dispatcher.store(), &created.id, ReviewDecision::Approve)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::InvalidTransition { .. })
    ));
    assert_eq!(
        dispatcher.store().get(&created.id).expect("get").status,
        TaskStatus::Pending
    );
}

#[test]
fn executed_plan_creates_tasks_that_run_and_complete_it() {
    let (repo, dispatcher) = setup();
    let plans = PlanStore::open(repo.paths());
    let plan = plans
        .create(
            "two markers",
            "split work",
            json!({
                "tasks": [
                    {"title": "first marker", "content": "write one file"},
                    {"title": "second marker", "task_type": "chore"}
                ]
            }),
        )
        .expect("create plan");
    assert_eq!(plan.status, PlanStatus::Draft);
    plans.mark_ready(&plan.id).expect("ready");

    let executing = plans.execute(&plan.id, dispatcher.store()).expect("execute");
    assert_eq!(executing.status, PlanStatus::Executing);
    assert_eq!(executing.task_ids.len(), 2);
    for task_id in &executing.task_ids {
        let task = dispatcher.store().get(task_id).expect("task");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.plan_id.as_deref(), Some(plan.id.as_str()));
    }

    let summary = dispatcher.run(RunMode::Drain).expect("run");
    assert_eq!(summary.completed, 2);
    let refreshed = plans.refresh(&plan.id, dispatcher.store()).expect("refresh");
    assert_eq!(refreshed.status, PlanStatus::Done);
}

#[test]
fn invalid_plan_content_marks_the_plan_failed() {
    let (repo, dispatcher) = setup();
    let plans = PlanStore::open(repo.paths());
    let plan = plans
        .create("empty", "", json!({"tasks": []}))
        .expect("create plan");

    let err = plans.execute(&plan.id, dispatcher.store()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::InvalidPlan { .. })
    ));
    let failed = plans.get(&plan.id).expect("get");
    assert_eq!(failed.status, PlanStatus::Failed);
    assert!(failed.error.is_some());
    assert!(dispatcher.store().list(None).expect("list").is_empty());
}
