//! Event fan-out: per-repo subscriptions with snapshot-then-delta semantics.
//!
//! Subscribers first receive a synthetic snapshot (active scan, last scan,
//! stored stack states), then live updates as published on the repo's
//! channel. Delivery of updates is best-effort by design: a client that
//! misses messages reconnects and gets a fresh snapshot.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;
use tracing::warn;

use crate::broker::{Broker, Subscription};
use crate::queue::{self, Queue};
use crate::repo::RepoName;
use crate::scan::{RepoEvent, Scan, ScanStatus, StackScan};
use crate::store::{StackSummary, Store};

/// Errors encountered in the event fan-out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening the subscription failed.
    #[error("subscribe to repo events")]
    Subscribe,

    /// Receiving from the subscription failed.
    #[error("receive repo event")]
    Receive,
}

/// Status labels as rendered for subscribers, normalized across scan,
/// stack scan, and stored-result states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StatusLabel {
    /// Work is in flight.
    Running,

    /// Finished successfully.
    Completed,

    /// Finished with a failure.
    Failed,

    /// Canceled before finishing.
    Canceled,

    /// Last evaluation found no drift.
    Healthy,

    /// Last evaluation found drift.
    Drifted,

    /// Last evaluation errored.
    Error,

    /// No information available.
    Unknown,
}

impl From<ScanStatus> for StatusLabel {
    fn from(status: ScanStatus) -> Self {
        match status {
            ScanStatus::Running => StatusLabel::Running,
            ScanStatus::Completed => StatusLabel::Completed,
            ScanStatus::Failed => StatusLabel::Failed,
            ScanStatus::Canceled => StatusLabel::Canceled,
        }
    }
}

/// The label for a stack's stored evaluation result.
pub fn result_label(summary: &StackSummary) -> StatusLabel {
    if !summary.error.is_empty() {
        StatusLabel::Error
    } else if summary.drifted {
        StatusLabel::Drifted
    } else {
        StatusLabel::Healthy
    }
}

/// One stack's state as carried in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    /// The stack path.
    pub path: String,

    /// Normalized status label.
    pub label: StatusLabel,

    /// Whether the last evaluation found drift.
    pub drifted: bool,

    /// The last evaluation's error, empty when it succeeded.
    pub error: String,

    /// When the last evaluation ran.
    #[serde(with = "time::serde::timestamp")]
    pub run_at: time::OffsetDateTime,
}

/// The synthetic first message of every subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The repository the snapshot describes.
    pub repo: RepoName,

    /// The scan currently holding the repo, if any.
    pub active: Option<Scan>,

    /// The most recently started scan, running or terminal, if any.
    pub last: Option<Scan>,

    /// Stored stack states.
    pub stacks: Vec<StackState>,
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The initial state sync.
    Snapshot {
        /// Current state of the repository.
        snapshot: Snapshot,
    },

    /// A scan changed state.
    ScanUpdate {
        /// The scan after the change.
        scan: Scan,
    },

    /// A stack scan changed state.
    StackUpdate {
        /// The stack scan after the change.
        stack_scan: StackScan,
    },
}

impl From<RepoEvent> for Event {
    fn from(event: RepoEvent) -> Self {
        match event {
            RepoEvent::ScanUpdate { scan } => Event::ScanUpdate { scan },
            RepoEvent::StackUpdate { stack_scan } => Event::StackUpdate { stack_scan },
        }
    }
}

/// Builds subscriptions that join queue state with stored results.
pub struct EventFanout<B, S> {
    queue: Arc<Queue<B>>,
    store: Arc<S>,
}

impl<B: Broker, S: Store> EventFanout<B, S> {
    /// Create a fan-out over the queue and result store.
    pub fn new(queue: Arc<Queue<B>>, store: Arc<S>) -> Self {
        Self { queue, store }
    }

    /// Subscribe to one repository's events.
    ///
    /// The subscription is opened before the snapshot is assembled, so a
    /// transition landing in between is delivered as a (redundant) update
    /// rather than lost.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe(&self, repo: &RepoName) -> Result<RepoEvents, Report<Error>> {
        let subscription = self
            .queue
            .subscribe(repo)
            .await
            .change_context(Error::Subscribe)?;

        let active = match self.queue.get_active_scan(repo).await {
            Ok(scan) => Some(scan),
            Err(err) if matches!(err.current_context(), queue::Error::ScanNotFound) => None,
            Err(err) => return Err(err.change_context(Error::Subscribe)),
        };
        let last = match self.queue.get_last_scan(repo).await {
            Ok(scan) => Some(scan),
            Err(err) if matches!(err.current_context(), queue::Error::ScanNotFound) => None,
            Err(err) => return Err(err.change_context(Error::Subscribe)),
        };
        let stacks = self
            .store
            .list_stacks(repo)
            .await
            .change_context(Error::Subscribe)?
            .iter()
            .map(|summary| StackState {
                path: String::from(summary.path.as_ref()),
                label: result_label(summary),
                drifted: summary.drifted,
                error: summary.error.clone(),
                run_at: summary.run_at,
            })
            .collect();

        let snapshot = Snapshot {
            repo: repo.clone(),
            active,
            last,
            stacks,
        };
        Ok(RepoEvents {
            pending_snapshot: Some(Event::Snapshot { snapshot }),
            subscription,
        })
    }
}

/// A live subscription: one snapshot, then updates until the channel closes.
pub struct RepoEvents {
    pending_snapshot: Option<Event>,
    subscription: Box<dyn Subscription>,
}

impl RepoEvents {
    /// The next message. `None` means the subscription ended.
    pub async fn next(&mut self) -> Result<Option<Event>, Report<Error>> {
        if let Some(snapshot) = self.pending_snapshot.take() {
            return Ok(Some(snapshot));
        }
        loop {
            let Some(payload) = self
                .subscription
                .next_message()
                .await
                .change_context(Error::Receive)?
            else {
                return Ok(None);
            };
            match serde_json::from_str::<RepoEvent>(&payload) {
                Ok(event) => return Ok(Some(Event::from(event))),
                Err(err) => {
                    // A malformed message is a version-skew artifact, not a
                    // reason to kill the subscription.
                    warn!("dropping undecodable event: {err}");
                }
            }
        }
    }
}
