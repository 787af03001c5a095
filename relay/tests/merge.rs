//! Integration pipeline behavior on conflicts, verification failures and
//! retries, driven directly against worktrees.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use relay::coordinator::Coordinator;
use relay::error::RelayError;
use relay::io::config::{ConflictPolicy, RelayConfig};
use relay::io::merge::MergePipeline;
use relay::io::verify::{VerifyOutcome, VerifyRunner};
use relay::io::workspace::{Workspace, WorkspaceManager};
use relay::test_support::{ScriptedVerifier, TestRepo, commit_file_in};

struct Fixture {
    repo: TestRepo,
    config: RelayConfig,
    coordinator: Arc<Coordinator>,
    workspaces: WorkspaceManager,
}

impl Fixture {
    fn new() -> Self {
        Self::from_repo(TestRepo::new().expect("repo"))
    }

    fn with_origin() -> Self {
        let mut fixture = Self::from_repo(TestRepo::with_origin().expect("repo"));
        fixture.config.push_to_remote = true;
        fixture
    }

    fn from_repo(repo: TestRepo) -> Self {
        repo.init_relay().expect("init");
        repo.commit_file("shared.txt", "base\n", "chore: add shared file")
            .expect("base commit");
        let mut config = RelayConfig::default();
        config.merge.git_timeout_secs = 30;
        let coordinator = Arc::new(Coordinator::new(&config));
        let workspaces = WorkspaceManager::new(repo.paths(), &config, Arc::clone(&coordinator));
        Self {
            repo,
            config,
            coordinator,
            workspaces,
        }
    }

    fn pipeline(&self, verifier: Arc<dyn VerifyRunner>) -> MergePipeline {
        MergePipeline::new(
            &self.repo.paths(),
            &self.config,
            verifier,
            Arc::clone(&self.coordinator),
        )
    }

    fn workspace_with_commit(&self, task_id: &str, rel: &str, contents: &str) -> Workspace {
        let workspace = self.workspaces.create(task_id).expect("workspace");
        commit_file_in(
            &workspace.path,
            rel,
            contents,
            &format!("feat({task_id}): change {rel}"),
        )
        .expect("task commit");
        workspace
    }
}

#[test]
fn conflicting_branch_leaves_integration_tip_untouched() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(ScriptedVerifier::passing());

    for trial in 0..3 {
        let task_id = format!("conflict-{trial}");
        let workspace = fixture.workspace_with_commit(&task_id, "shared.txt", "task side\n");
        fixture
            .repo
            .commit_file("shared.txt", &format!("main side {trial}\n"), "chore: move main")
            .expect("main commit");
        let before = fixture.repo.git().rev_parse("main").expect("tip");

        let err = pipeline.integrate(&workspace).unwrap_err();
        match err.downcast_ref::<RelayError>() {
            Some(RelayError::MergeConflict { details, .. }) => {
                assert!(details.contains("shared.txt"), "{details}");
            }
            other => panic!("expected merge conflict, got {other:?}"),
        }

        assert_eq!(fixture.repo.git().rev_parse("main").expect("tip"), before);
        assert!(fixture.repo.git().is_clean().expect("root status"));
        let task_git = fixture.repo.git().at(&workspace.path);
        assert!(!task_git.merge_in_progress().expect("merge state"));
        fixture.workspaces.cleanup(&task_id).expect("cleanup");
    }
}

#[test]
fn failed_verification_is_retried_then_integrated() {
    let fixture = Fixture::new();
    let verifier = ScriptedVerifier::new(vec![VerifyOutcome::Fail {
        output: "1 test failed".to_string(),
    }]);
    let pipeline = fixture.pipeline(Arc::clone(&verifier) as Arc<dyn VerifyRunner>);
    let workspace = fixture.workspace_with_commit("retry-me", "feature.txt", "new\n");

    let report = pipeline.integrate(&workspace).expect("integrate");
    assert_eq!(report.attempts, 2);
    assert_eq!(verifier.calls(), 2);
    assert_eq!(
        report.integrated_head,
        fixture.repo.git().rev_parse("main").expect("tip")
    );
    assert!(fixture.repo.path().join("feature.txt").is_file());
}

/// Origin hook that refuses the first push it sees and accepts the rest.
const REJECT_FIRST_PUSH_HOOK: &str = r#"#!/bin/sh
marker="$GIT_DIR/rejected-once"
if [ ! -e "$marker" ]; then
  touch "$marker"
  echo "rejected: try again" >&2
  exit 1
fi
exit 0
"#;

#[test]
fn rejected_push_is_retried_until_origin_matches() {
    let fixture = Fixture::with_origin();
    let origin = fixture.repo.origin().expect("origin").to_path_buf();
    let hook = origin.join("hooks").join("pre-receive");
    fs::create_dir_all(hook.parent().expect("hooks dir")).expect("hooks dir");
    fs::write(&hook, REJECT_FIRST_PUSH_HOOK).expect("hook");
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).expect("hook mode");

    let pipeline = fixture.pipeline(ScriptedVerifier::passing());
    let workspace = fixture.workspace_with_commit("pushed", "feature.txt", "new\n");

    let report = pipeline.integrate(&workspace).expect("integrate");
    assert_eq!(report.attempts, 2);
    assert!(origin.join("rejected-once").exists());

    let local_tip = fixture.repo.git().rev_parse("main").expect("tip");
    let origin_tip = fixture.repo.git().at(&origin).rev_parse("main").expect("origin tip");
    assert_eq!(origin_tip, local_tip);
    assert_eq!(report.integrated_head, local_tip);
    assert!(fixture.repo.git().is_clean().expect("root status"));
}

#[test]
fn exhausted_retries_report_every_attempt() {
    let mut fixture = Fixture::new();
    fixture.config.merge.max_attempts = 2;
    let failing = || VerifyOutcome::Fail {
        output: "lint error".to_string(),
    };
    let verifier = ScriptedVerifier::new(vec![failing(), failing()]);
    let pipeline = fixture.pipeline(verifier);
    let workspace = fixture.workspace_with_commit("never-green", "feature.txt", "new\n");
    let before = fixture.repo.git().rev_parse("main").expect("tip");

    let err = pipeline.integrate(&workspace).unwrap_err();
    match err.downcast_ref::<RelayError>() {
        Some(RelayError::MergeRetriesExhausted {
            attempts,
            diagnostics,
            ..
        }) => {
            assert_eq!(*attempts, 2);
            assert!(diagnostics.contains("=== attempt 1"));
            assert!(diagnostics.contains("=== attempt 2"));
            assert!(diagnostics.contains("lint error"));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(fixture.repo.git().rev_parse("main").expect("tip"), before);
}

#[test]
fn retry_policy_counts_conflicts_as_attempts() {
    let mut fixture = Fixture::new();
    fixture.config.merge.conflict_policy = ConflictPolicy::Retry;
    fixture.config.merge.max_attempts = 2;
    let pipeline = fixture.pipeline(ScriptedVerifier::passing());
    let workspace = fixture.workspace_with_commit("stubborn", "shared.txt", "task side\n");
    fixture
        .repo
        .commit_file("shared.txt", "main side\n", "chore: move main")
        .expect("main commit");

    let err = pipeline.integrate(&workspace).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RelayError>(),
        Some(RelayError::MergeRetriesExhausted { attempts: 2, .. })
    ));
}

#[test]
fn later_branch_is_rebased_onto_earlier_integration() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline(ScriptedVerifier::passing());
    let first = fixture.workspace_with_commit("first", "a.txt", "a\n");
    let second = fixture.workspace_with_commit("second", "b.txt", "b\n");

    let first_head = pipeline.integrate(&first).expect("first").integrated_head;
    let second_head = pipeline.integrate(&second).expect("second").integrated_head;

    let git = fixture.repo.git();
    assert!(git.is_ancestor(&first_head, &second_head).expect("ancestry"));
    let merges = git
        .run_capture(&["log", "--merges", "--format=%H", "main"])
        .expect("merges");
    assert!(merges.trim().is_empty(), "unexpected merge commits: {merges}");
}
