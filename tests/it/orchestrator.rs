//! Orchestrator behavior against real git fixtures: discovery, webhook
//! change selection, supersession, and failure paths.

use std::sync::Arc;
use std::time::Duration;

use driftmon::broker::memory::MemoryBroker;
use driftmon::orchestrator::{self, Orchestrator, SUPERSEDED_REASON};
use driftmon::queue::Queue;
use driftmon::repo::RepoConfig;
use driftmon::scan::{ScanStatus, Trigger};
use driftmon::workspace::Workspaces;

use crate::helper::{memory_queue, repo_config};

struct Fixture {
    queue: Arc<Queue<MemoryBroker>>,
    orchestrator: Orchestrator<MemoryBroker>,
    _data_root: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let (_broker, queue) = memory_queue();
    let data_root = tempfile::tempdir().expect("must create data root");
    let workspaces = Workspaces::new(data_root.path(), 3);
    let orchestrator = Orchestrator::new(
        Arc::clone(&queue),
        workspaces,
        orchestrator::Options {
            max_retries: 1,
            scan_max_age: Duration::from_secs(60),
            renew_every: Duration::from_millis(200),
        },
    );
    Fixture {
        queue,
        orchestrator,
        _data_root: data_root,
    }
}

fn file_repo(name: &str, fixture: &tempfile::TempDir, cancel_inflight: bool) -> RepoConfig {
    repo_config(name, &fixture.path().display().to_string(), cancel_inflight)
}

#[tokio::test]
async fn discovers_and_enqueues_all_stacks() {
    let source = crate::helper::git_fixture(&[
        ("envs/prod/main.tf", "resource {}"),
        ("envs/dev/terragrunt.hcl", "terraform {}"),
        ("README.md", "# infra"),
    ]);
    let fx = fixture();
    let repo = file_repo("infra", &source, false);

    let (scan, outcome) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start and enqueue");

    assert_eq!(scan.status, ScanStatus::Running);
    assert_eq!(scan.counters.total, 2);
    assert_eq!(scan.counters.queued, 2);
    assert_eq!(outcome.enqueued.len(), 2);
    assert_eq!(outcome.skipped, 0);
    assert!(scan.commit_sha.is_some(), "clone must resolve a commit");
    assert!(scan.workspace.is_some(), "clone must record the workspace");

    let active = fx
        .queue
        .get_active_scan(repo.name())
        .await
        .expect("active scan must exist");
    assert_eq!(active.id, scan.id);
}

#[tokio::test]
async fn single_stack_scan_is_running_at_return() {
    let source = crate::helper::git_fixture(&[("dev/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("single", &source, false);

    let (scan, outcome) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start and enqueue");

    assert_eq!(scan.status, ScanStatus::Running);
    assert_eq!(scan.counters.total, 1);
    assert_eq!(scan.counters.queued, 1);
    assert_eq!(outcome.enqueued.len(), 1);
}

#[tokio::test]
async fn no_stacks_discovered_fails_the_scan() {
    let source = crate::helper::git_fixture(&[("README.md", "# empty")]);
    let fx = fixture();
    let repo = file_repo("empty", &source, false);

    let err = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect_err("must fail");
    assert!(matches!(
        err.current_context(),
        orchestrator::Error::NoStacksDiscovered
    ));

    let scan = fx
        .queue
        .get_last_scan(repo.name())
        .await
        .expect("scan record must exist");
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.error.as_deref(), Some("no stacks discovered"));

    // The failure released the repo for the next trigger.
    assert!(fx.queue.get_active_scan(repo.name()).await.is_err());
}

#[tokio::test]
async fn clone_failure_fails_the_scan() {
    let fx = fixture();
    let repo = repo_config("missing", "/nonexistent/driftmon-test-repo", false);

    let err = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect_err("must fail");
    assert!(matches!(err.current_context(), orchestrator::Error::Clone));

    let scan = fx
        .queue
        .get_last_scan(repo.name())
        .await
        .expect("scan record must exist");
    assert_eq!(scan.status, ScanStatus::Failed);
    assert!(scan.error.is_some());
}

#[tokio::test]
async fn locked_repo_without_preemption_returns_repo_locked() {
    let source = crate::helper::git_fixture(&[("envs/prod/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("locked", &source, false);

    let (first, _) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start first scan");

    let err = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect_err("second must be rejected");
    assert!(matches!(
        err.current_context(),
        orchestrator::Error::RepoLocked
    ));

    let active = fx
        .queue
        .get_active_scan(repo.name())
        .await
        .expect("active scan must exist");
    assert_eq!(active.id, first.id, "the first scan must be untouched");
}

#[tokio::test]
async fn equal_priority_trigger_supersedes_active_scan() {
    let source = crate::helper::git_fixture(&[("envs/prod/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("preempt", &source, true);

    let (first, _) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start first scan");

    let (second, _) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("equal-priority trigger must supersede");
    assert_ne!(second.id, first.id);

    let superseded = fx.queue.get_scan(&first.id).await.expect("must fetch scan");
    assert_eq!(superseded.status, ScanStatus::Canceled);
    assert_eq!(superseded.error.as_deref(), Some(SUPERSEDED_REASON));

    let active = fx
        .queue
        .get_active_scan(repo.name())
        .await
        .expect("active scan must exist");
    assert_eq!(active.id, second.id);
}

#[tokio::test]
async fn lower_priority_trigger_never_preempts() {
    let source = crate::helper::git_fixture(&[("envs/prod/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("sticky", &source, true);

    let (first, _) = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start first scan");

    let err = fx
        .orchestrator
        .start_and_enqueue(&repo, Trigger::Scheduled, None, "cron")
        .await
        .expect_err("scheduled must not preempt manual");
    assert!(matches!(
        err.current_context(),
        orchestrator::Error::RepoLocked
    ));

    let unchanged = fx.queue.get_scan(&first.id).await.expect("must fetch scan");
    assert_eq!(unchanged.status, ScanStatus::Running);
}

#[tokio::test]
async fn webhook_selects_only_touched_stacks() {
    let source = crate::helper::git_fixture(&[
        ("envs/prod/main.tf", "resource {}"),
        ("envs/dev/main.tf", "resource {}"),
    ]);
    let fx = fixture();
    let repo = file_repo("hooked", &source, false);

    let started = fx
        .orchestrator
        .start_for_changes(
            &repo,
            None,
            "webhook",
            &[String::from("envs/prod/main.tf")],
        )
        .await
        .expect("must start webhook scan")
        .expect("infra changes must create a scan");

    let (scan, outcome) = started;
    assert_eq!(scan.counters.total, 1);
    assert_eq!(outcome.enqueued.len(), 1);
    assert!(
        outcome.enqueued[0].as_ref().ends_with(":envs/prod"),
        "only the touched stack is enqueued"
    );
}

#[tokio::test]
async fn webhook_without_infra_changes_is_acknowledged() {
    let source = crate::helper::git_fixture(&[("envs/prod/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("quiet", &source, false);

    let started = fx
        .orchestrator
        .start_for_changes(&repo, None, "webhook", &[String::from("README.md")])
        .await
        .expect("must acknowledge");
    assert!(started.is_none(), "no scan may be created");
    assert!(
        fx.queue.get_last_scan(repo.name()).await.is_err(),
        "no scan record may exist"
    );
}

#[tokio::test]
async fn webhook_with_unmatched_infra_changes_fails_the_scan() {
    let source = crate::helper::git_fixture(&[("envs/prod/main.tf", "resource {}")]);
    let fx = fixture();
    let repo = file_repo("unmatched", &source, false);

    let err = fx
        .orchestrator
        .start_for_changes(
            &repo,
            None,
            "webhook",
            &[String::from("elsewhere/other.tf")],
        )
        .await
        .expect_err("must fail");
    assert!(matches!(
        err.current_context(),
        orchestrator::Error::NoMatchingStacks
    ));

    let scan = fx
        .queue
        .get_last_scan(repo.name())
        .await
        .expect("scan record must exist");
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(
        scan.error.as_deref(),
        Some("no matching stacks for webhook changes")
    );
}
