//! Queue-level behavior: locking, enqueue idempotence, progress accounting,
//! and terminal reconciliation.

use std::time::Duration;

use driftmon::queue::{self, Options, ProgressOutcome, Queue, StackOutcome};
use driftmon::scan::{ScanStatus, StackPath, StackStatus, Trigger};

use crate::helper::{memory_queue, repo_config};

fn stack(path: &str) -> StackPath {
    StackPath::try_from(path).expect("must validate stack path")
}

#[tokio::test]
async fn second_start_fails_with_repo_locked() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let first = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start first scan");

    let second = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect_err("second scan must be rejected");
    assert!(matches!(
        second.current_context(),
        queue::Error::RepoLocked
    ));

    let active = queue
        .get_active_scan(repo.name())
        .await
        .expect("active scan must exist");
    assert_eq!(active.id, first.id);
}

#[tokio::test]
async fn release_only_works_for_the_holder() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");

    let released = queue
        .release_scan_lock(repo.name(), &driftmon::scan::ScanId::from("someone-else"))
        .await
        .expect("release must not error");
    assert!(!released, "a non-holder must not release the lock");

    let released = queue
        .release_scan_lock(repo.name(), &scan.id)
        .await
        .expect("release must not error");
    assert!(released, "the holder must release the lock");
}

#[tokio::test]
async fn lock_expires_without_renewal() {
    let broker = std::sync::Arc::new(driftmon::broker::memory::MemoryBroker::new());
    let queue = Queue::new(
        std::sync::Arc::clone(&broker),
        Options {
            lock_ttl: Duration::from_millis(50),
            ..crate::helper::test_options()
        },
    );
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    queue
        .start_scan(&repo, Trigger::Scheduled, None, "cron")
        .await
        .expect("must start first scan");
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The stuck scan's lock lapsed; a new trigger may take the repo over.
    queue
        .start_scan(&repo, Trigger::Scheduled, None, "cron")
        .await
        .expect("must start after lock expiry");
}

#[tokio::test]
async fn enqueue_rejects_inflight_duplicates() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");

    let first = queue::stack_scan_for(&scan, "https://example.com/infra.git", stack("envs/prod"), 1);
    queue.enqueue(first).await.expect("must enqueue first");

    let duplicate =
        queue::stack_scan_for(&scan, "https://example.com/infra.git", stack("envs/prod"), 1);
    let rejected = queue.enqueue(duplicate).await.expect_err("must reject");
    assert!(matches!(
        rejected.current_context(),
        queue::Error::StackScanInflight
    ));

    let scan = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(scan.counters.queued, 1, "the duplicate must not be counted");
}

#[tokio::test]
async fn progress_reconciles_terminal_state() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    queue
        .set_scan_total(&scan.id, 2)
        .await
        .expect("must set total");

    for path in ["envs/prod", "envs/dev"] {
        let stack_scan =
            queue::stack_scan_for(&scan, "https://example.com/infra.git", stack(path), 1);
        queue.enqueue(stack_scan).await.expect("must enqueue");
    }

    let prod = queue
        .claim(Duration::from_millis(100))
        .await
        .expect("claim must not error")
        .expect("must claim first stack scan");
    let prod = queue
        .mark_stack_running(&prod)
        .await
        .expect("must mark running")
        .expect("stack scan must still be pending");
    let outcome = queue
        .progress(&prod, StackOutcome::Completed { drifted: true })
        .await
        .expect("must progress");
    assert_eq!(outcome, ProgressOutcome::Advanced);

    let mid = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(mid.status, ScanStatus::Running);
    assert_eq!(mid.counters.completed, 1);
    assert_eq!(mid.counters.drifted, 1);
    assert!(mid.ended_at.is_none(), "a running scan has no end time");

    let dev = queue
        .claim(Duration::from_millis(100))
        .await
        .expect("claim must not error")
        .expect("must claim second stack scan");
    let dev = queue
        .mark_stack_running(&dev)
        .await
        .expect("must mark running")
        .expect("stack scan must still be pending");
    let outcome = queue
        .progress(
            &dev,
            StackOutcome::Failed {
                error: String::from("evaluator exploded"),
                evaluator_error: true,
            },
        )
        .await
        .expect("must progress");
    assert_eq!(outcome, ProgressOutcome::ScanFinished);

    let done = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.counters.completed, 1);
    assert_eq!(done.counters.failed, 1);
    assert_eq!(done.counters.errored, 1);
    assert!(done.counters.drifted <= done.counters.completed);
    assert!(done.counters.errored <= done.counters.failed);
    assert!(done.ended_at.is_some(), "a terminal scan has an end time");

    // Terminal means the lock is released and the repo has no active scan.
    let active = queue.get_active_scan(repo.name()).await;
    assert!(active.is_err(), "no scan may be active after completion");
    queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("the repo must be startable again");
}

#[tokio::test]
async fn cancel_scan_cancels_pending_stacks() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    queue
        .set_scan_total(&scan.id, 1)
        .await
        .expect("must set total");
    let stack_scan =
        queue::stack_scan_for(&scan, "https://example.com/infra.git", stack("envs/prod"), 1);
    let stack_id = stack_scan.id.clone();
    queue.enqueue(stack_scan).await.expect("must enqueue");

    queue
        .cancel_scan(&scan.id, repo.name(), "operator asked")
        .await
        .expect("must cancel");

    let canceled = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(canceled.status, ScanStatus::Canceled);
    assert_eq!(canceled.error.as_deref(), Some("operator asked"));

    let stack_scan = queue
        .get_stack_scan(&stack_id)
        .await
        .expect("must fetch stack scan");
    assert_eq!(stack_scan.status, StackStatus::Canceled);

    // A claim of the canceled id yields it, but marking it running fails,
    // which is how workers learn to drop it.
    let claimed = queue
        .claim(Duration::from_millis(100))
        .await
        .expect("claim must not error")
        .expect("the id is still queued");
    let running = queue
        .mark_stack_running(&claimed)
        .await
        .expect("must not error");
    assert!(running.is_none(), "a canceled stack scan may not start");
}

#[tokio::test]
async fn cancel_requires_lock_ownership() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");

    let denied = queue
        .cancel_scan(
            &driftmon::scan::ScanId::from("not-the-holder"),
            repo.name(),
            "nope",
        )
        .await
        .expect_err("a non-holder must not cancel");
    assert!(matches!(
        denied.current_context(),
        queue::Error::NotLockHolder
    ));

    let unchanged = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(unchanged.status, ScanStatus::Running);
}

#[tokio::test]
async fn claim_order_is_fifo() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    for path in ["a", "b", "c"] {
        let stack_scan =
            queue::stack_scan_for(&scan, "https://example.com/infra.git", stack(path), 1);
        queue.enqueue(stack_scan).await.expect("must enqueue");
    }

    for expected in ["a", "b", "c"] {
        let claimed = queue
            .claim(Duration::from_millis(100))
            .await
            .expect("claim must not error")
            .expect("must claim");
        assert_eq!(claimed.stack.as_ref(), expected);
    }
}

#[tokio::test]
async fn retry_requeues_with_bumped_count() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    queue
        .set_scan_total(&scan.id, 1)
        .await
        .expect("must set total");
    let stack_scan =
        queue::stack_scan_for(&scan, "https://example.com/infra.git", stack("envs/prod"), 2);
    queue.enqueue(stack_scan).await.expect("must enqueue");

    let claimed = queue
        .claim(Duration::from_millis(100))
        .await
        .expect("claim must not error")
        .expect("must claim");
    let running = queue
        .mark_stack_running(&claimed)
        .await
        .expect("must mark running")
        .expect("must be pending");

    let requeued = queue
        .requeue_retry(&running, "connection reset")
        .await
        .expect("must requeue");
    assert!(requeued);

    let again = queue
        .claim(Duration::from_millis(100))
        .await
        .expect("claim must not error")
        .expect("must claim retry");
    assert_eq!(again.retries, 1);
    assert_eq!(again.status, StackStatus::Pending);

    let scan = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(scan.counters.queued, 1);
    assert_eq!(scan.counters.running, 0);
}
