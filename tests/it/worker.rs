//! Worker pool behavior: the happy path, cancellation of in-flight work,
//! and retry of infrastructure failures.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use driftmon::queue::{self, Queue};
use driftmon::repo::{RepoConfig, RepoProvider};
use driftmon::scan::{Scan, ScanStatus, StackPath, StackStatus, Trigger};
use driftmon::store::Store;
use driftmon::worker::{Options, WorkerPool};
use driftmon::workspace::Workspaces;

use crate::helper::{memory_queue, repo_config, wait_until, Behavior, MemoryStore, StubRunner};

fn worker_options(concurrency: usize) -> Options {
    Options {
        concurrency,
        claim_wait: Duration::from_millis(50),
        cancel_poll: Duration::from_millis(50),
        stop_grace: Duration::from_secs(5),
    }
}

struct Fixture {
    queue: Arc<Queue<driftmon::broker::memory::MemoryBroker>>,
    runner: Arc<StubRunner>,
    store: Arc<MemoryStore>,
    pool: WorkerPool<driftmon::broker::memory::MemoryBroker, StubRunner, MemoryStore>,
    repo: RepoConfig,
    scan: Scan,
    _workspace: tempfile::TempDir,
    _data_root: tempfile::TempDir,
}

/// Start a scan over the given stacks with a real workspace directory on
/// disk, plus a worker pool wired to stub runner and store.
async fn fixture(stacks: &[&str], max_retries: u32, concurrency: usize) -> Fixture {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let workspace = tempfile::tempdir().expect("must create workspace");
    for stack in stacks {
        let dir = workspace.path().join(stack);
        fs::create_dir_all(&dir).expect("must create stack dir");
        fs::write(dir.join("main.tf"), "resource {}").expect("must write manifest");
    }

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    queue
        .set_scan_workspace(&scan.id, &workspace.path().display().to_string(), "deadbeef")
        .await
        .expect("must set workspace");
    queue
        .set_scan_total(&scan.id, stacks.len())
        .await
        .expect("must set total");
    for stack in stacks {
        let stack_scan = queue::stack_scan_for(
            &scan,
            "https://example.com/infra.git",
            StackPath::try_from(*stack).expect("must validate"),
            max_retries,
        );
        queue.enqueue(stack_scan).await.expect("must enqueue");
    }

    let runner = Arc::new(StubRunner::new());
    let store = Arc::new(MemoryStore::new());
    let data_root = tempfile::tempdir().expect("must create data root");
    let workspaces = Workspaces::new(data_root.path(), 3);
    let repos: Arc<dyn RepoProvider> = Arc::new(SingleRepo(repo.clone()));
    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&runner),
        Arc::clone(&store),
        repos,
        workspaces,
        worker_options(concurrency),
    );

    Fixture {
        queue,
        runner,
        store,
        pool,
        repo,
        scan,
        _workspace: workspace,
        _data_root: data_root,
    }
}

/// A provider that knows exactly one repository.
struct SingleRepo(RepoConfig);

#[async_trait::async_trait]
impl RepoProvider for SingleRepo {
    async fn get(
        &self,
        name: &driftmon::repo::RepoName,
    ) -> error_stack::Result<RepoConfig, driftmon::repo::Error> {
        if self.0.name() == name {
            Ok(self.0.clone())
        } else {
            Err(error_stack::Report::new(driftmon::repo::Error::RepoNotFound))
        }
    }

    async fn list(&self) -> error_stack::Result<Vec<RepoConfig>, driftmon::repo::Error> {
        Ok(vec![self.0.clone()])
    }
}

async fn wait_for_terminal(fixture: &Fixture) -> Scan {
    let queue = Arc::clone(&fixture.queue);
    let id = fixture.scan.id.clone();
    let finished = wait_until(Duration::from_secs(10), || {
        let queue = Arc::clone(&queue);
        let id = id.clone();
        async move {
            queue
                .get_scan(&id)
                .await
                .map(|scan| scan.status.is_terminal())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(finished, "scan must reach a terminal state");
    fixture
        .queue
        .get_scan(&fixture.scan.id)
        .await
        .expect("must fetch scan")
}

#[tokio::test]
async fn two_stack_happy_path() {
    let fixture = fixture(&["envs/prod", "envs/dev"], 1, 2).await;
    fixture.runner.behave("envs/prod", Behavior::Drifted).await;
    fixture.runner.behave("envs/dev", Behavior::Clean).await;

    fixture.pool.start().await;
    let scan = wait_for_terminal(&fixture).await;
    fixture.pool.stop().await;

    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.counters.total, 2);
    assert_eq!(scan.counters.completed, 2);
    assert_eq!(scan.counters.failed, 0);
    assert_eq!(scan.counters.drifted, 1);
    assert_eq!(scan.counters.errored, 0);

    let prod = fixture
        .store
        .get_result(
            fixture.repo.name(),
            &StackPath::try_from("envs/prod").expect("must validate"),
        )
        .await
        .expect("must read")
        .expect("result must exist");
    assert!(prod.drifted);
}

#[tokio::test]
async fn evaluator_failure_counts_as_errored() {
    let fixture = fixture(&["envs/prod"], 0, 1).await;
    fixture
        .runner
        .behave("envs/prod", Behavior::EvalError("provider credentials expired"))
        .await;

    fixture.pool.start().await;
    let scan = wait_for_terminal(&fixture).await;
    fixture.pool.stop().await;

    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.counters.failed, 1);
    assert_eq!(scan.counters.errored, 1);

    // The evaluator ran; its failed result is still persisted.
    let result = fixture
        .store
        .get_result(
            fixture.repo.name(),
            &StackPath::try_from("envs/prod").expect("must validate"),
        )
        .await
        .expect("must read")
        .expect("result must exist");
    assert_eq!(result.error, "provider credentials expired");
}

#[tokio::test]
async fn infrastructure_failure_retries_then_succeeds() {
    let fixture = fixture(&["envs/prod"], 1, 1).await;
    fixture.runner.behave("envs/prod", Behavior::InfraError).await;
    fixture.runner.behave("envs/prod", Behavior::Clean).await;

    fixture.pool.start().await;
    let scan = wait_for_terminal(&fixture).await;
    fixture.pool.stop().await;

    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.counters.completed, 1);
    assert_eq!(scan.counters.failed, 0);
}

#[tokio::test]
async fn infrastructure_failure_exhausts_retries() {
    let fixture = fixture(&["envs/prod"], 1, 1).await;
    fixture.runner.behave("envs/prod", Behavior::InfraError).await;
    fixture.runner.behave("envs/prod", Behavior::InfraError).await;

    fixture.pool.start().await;
    let scan = wait_for_terminal(&fixture).await;
    fixture.pool.stop().await;

    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.counters.failed, 1);
    assert_eq!(
        scan.counters.errored, 0,
        "infrastructure failures are not evaluator errors"
    );
}

#[tokio::test]
async fn cancellation_aborts_inflight_evaluation() {
    let fixture = fixture(&["envs/prod"], 0, 1).await;
    fixture.runner.behave("envs/prod", Behavior::Block).await;

    fixture.pool.start().await;

    // Wait for the worker to pick the stack up.
    let queue = Arc::clone(&fixture.queue);
    let stack_id = driftmon::scan::StackScanId::derive(
        &fixture.scan.id,
        &StackPath::try_from("envs/prod").expect("must validate"),
    );
    {
        let queue = Arc::clone(&queue);
        let stack_id = stack_id.clone();
        let running = wait_until(Duration::from_secs(5), move || {
            let queue = Arc::clone(&queue);
            let stack_id = stack_id.clone();
            async move {
                queue
                    .get_stack_scan(&stack_id)
                    .await
                    .map(|stack| stack.status == StackStatus::Running)
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(running, "the stack scan must reach running");
    }

    fixture
        .queue
        .cancel_scan(&fixture.scan.id, fixture.repo.name(), "operator asked")
        .await
        .expect("must cancel");

    let scan = wait_for_terminal(&fixture).await;
    fixture.pool.stop().await;

    assert_eq!(scan.status, ScanStatus::Canceled);
    assert_eq!(scan.counters.completed, 0);
    assert_eq!(scan.counters.failed, 0);

    let stack = fixture
        .queue
        .get_stack_scan(&stack_id)
        .await
        .expect("must fetch stack scan");
    assert_eq!(stack.status, StackStatus::Canceled);
    assert_eq!(
        fixture.store.len().await,
        0,
        "a canceled stack scan must not persist results"
    );
}
