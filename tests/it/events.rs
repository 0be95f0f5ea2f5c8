//! Event fan-out behavior: snapshot on subscribe, then live deltas.

use std::sync::Arc;
use std::time::Duration;

use driftmon::events::{Event, EventFanout, StatusLabel};
use driftmon::queue;
use driftmon::scan::{ScanStatus, StackPath, Trigger};
use driftmon::store::Store;

use crate::helper::{memory_queue, repo_config, MemoryStore};

#[tokio::test]
async fn subscription_starts_with_a_snapshot() {
    let (_broker, queue) = memory_queue();
    let store = Arc::new(MemoryStore::new());
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    // Seed a stored result and an active scan so the snapshot has content.
    let prod = StackPath::try_from("envs/prod").expect("must validate");
    store
        .save_result(
            repo.name(),
            &prod,
            &driftmon::runner::RunResult {
                drifted: true,
                plan_output: String::from("Plan: 1 to add."),
                error: String::new(),
                run_at: time::OffsetDateTime::now_utc(),
            },
        )
        .await
        .expect("must save");
    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");

    let fanout = EventFanout::new(Arc::clone(&queue), store);
    let mut events = fanout.subscribe(repo.name()).await.expect("must subscribe");

    let first = events
        .next()
        .await
        .expect("must receive")
        .expect("subscription must be live");
    match first {
        Event::Snapshot { snapshot } => {
            assert_eq!(snapshot.repo, *repo.name());
            assert_eq!(
                snapshot.active.as_ref().map(|active| &active.id),
                Some(&scan.id)
            );
            assert_eq!(snapshot.stacks.len(), 1);
            assert_eq!(snapshot.stacks[0].label, StatusLabel::Drifted);
        }
        other => panic!("first message must be a snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn updates_follow_the_snapshot() {
    let (_broker, queue) = memory_queue();
    let store = Arc::new(MemoryStore::new());
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let fanout = EventFanout::new(Arc::clone(&queue), store);
    let mut events = fanout.subscribe(repo.name()).await.expect("must subscribe");

    let first = events
        .next()
        .await
        .expect("must receive")
        .expect("subscription must be live");
    assert!(matches!(first, Event::Snapshot { .. }));

    // A scan starting publishes a scan update on the repo channel.
    let scan = queue
        .start_scan(&repo, Trigger::Webhook, None, "webhook")
        .await
        .expect("must start scan");

    let second = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("must not time out")
        .expect("must receive")
        .expect("subscription must be live");
    match second {
        Event::ScanUpdate { scan: updated } => {
            assert_eq!(updated.id, scan.id);
            assert_eq!(updated.status, ScanStatus::Running);
        }
        other => panic!("expected a scan update, got {other:?}"),
    }
}

#[tokio::test]
async fn terminal_transition_publishes_exactly_one_scan_update() {
    let (_broker, queue) = memory_queue();
    let store = Arc::new(MemoryStore::new());
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");

    let fanout = EventFanout::new(Arc::clone(&queue), store);
    let mut events = fanout.subscribe(repo.name()).await.expect("must subscribe");
    let _snapshot = events.next().await.expect("must receive");

    queue
        .cancel_scan(&scan.id, repo.name(), "operator asked")
        .await
        .expect("must cancel");

    let mut terminal_updates = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(500), events.next()).await {
            Ok(Ok(Some(Event::ScanUpdate { scan: updated }))) if updated.status.is_terminal() => {
                assert_eq!(updated.status, ScanStatus::Canceled);
                terminal_updates += 1;
            }
            Ok(Ok(Some(_))) => {}
            _ => break,
        }
    }
    assert_eq!(terminal_updates, 1);
}

#[tokio::test]
async fn progress_percent_is_available_on_scan_updates() {
    let (_broker, queue) = memory_queue();
    let repo = repo_config("infra", "https://example.com/infra.git", false);

    let scan = queue
        .start_scan(&repo, Trigger::Manual, None, "tester")
        .await
        .expect("must start scan");
    queue
        .set_scan_total(&scan.id, 10)
        .await
        .expect("must set total");

    let stack_scan = queue::stack_scan_for(
        &scan,
        "https://example.com/infra.git",
        StackPath::try_from("envs/prod").expect("must validate"),
        1,
    );
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
    queue
        .progress(&running, queue::StackOutcome::Completed { drifted: false })
        .await
        .expect("must progress");

    let updated = queue.get_scan(&scan.id).await.expect("must fetch scan");
    assert_eq!(updated.progress_percent(), 10);
}
