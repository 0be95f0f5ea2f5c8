//! Broker-backed queue of scans and stack scans.
//!
//! This module exclusively owns the broker encoding of [`Scan`] and
//! [`StackScan`] records, the per-repository scan lock, progress accounting,
//! and event publication. The orchestrator and the worker pool never touch
//! broker state except through the operations here.
//!
//! # Key layout
//!
//! - `scan:<id>` — scan record (hash)
//! - `scan:repo:<repo>` — active scan pointer
//! - `scan:last:<repo>` — latest scan pointer
//! - `scan:stack_scans:<id>` — per-scan stack scan index (sorted)
//! - `stack:<id>` — stack scan record (hash)
//! - `stack:repo:<repo>` — per-repo stack scan index (sorted, bounded)
//! - `lock:repo:<repo>` — scan lock; value is the owning scan id
//! - `queue:stack_scans` — worker-consumable FIFO of stack scan ids
//! - `events:<repo>` — pub/sub channel of [`RepoEvent`]s

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{report, Report, ResultExt};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::broker::{Broker, Subscription};
use crate::ext::error_stack::IntoContext;
use crate::ext::result::{WrapErr, WrapOk};
use crate::repo::{RepoConfig, RepoName};
use crate::scan::{
    Counters, RepoEvent, Scan, ScanId, ScanStatus, StackPath, StackScan, StackScanId, StackStatus,
    ToolVersions, Trigger,
};

/// The worker-consumable queue of stack scan ids. One global pool: FIFO per
/// producer, no ordering promises across repositories.
const WORK_QUEUE: &str = "queue:stack_scans";

/// Upper bound on stacks per scan when enumerating a scan's stack index.
const MAX_STACKS_PER_SCAN: usize = 100_000;

/// Errors encountered using the queue.
///
/// The first four variants are boundary sentinels: callers match on them via
/// [`error_stack::Report::current_context`] for flow control.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another scan currently holds the repository lock.
    #[error("repository scan already in flight")]
    RepoLocked,

    /// No scan record exists for the requested id or pointer.
    #[error("scan not found")]
    ScanNotFound,

    /// No stack scan record exists for the requested id.
    #[error("stack scan not found")]
    StackScanNotFound,

    /// A non-terminal stack scan already exists for the same scan and stack.
    #[error("stack scan already in flight")]
    StackScanInflight,

    /// The caller tried to finish a scan it does not own.
    #[error("scan does not hold the repository lock")]
    NotLockHolder,

    /// An underlying broker operation failed.
    #[error("broker operation")]
    Broker,

    /// Serializing a record for the broker failed.
    #[error("encode record")]
    Encode,

    /// A broker record could not be decoded; usually a sign of mixed
    /// incompatible versions writing to the same broker.
    #[error("decode record: {0}")]
    Decode(String),
}

/// Tuning knobs for the queue.
#[derive(Debug, Clone)]
pub struct Options {
    /// TTL of the per-repo scan lock. Renewal must run at most every third
    /// of this to tolerate transient broker failures.
    pub lock_ttl: Duration,

    /// How long terminal scan and stack scan records stay readable before
    /// the broker evicts them.
    pub record_ttl: Duration,

    /// Bound on the per-repo stack scan listing index.
    pub index_retention: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            record_ttl: Duration::from_secs(24 * 60 * 60),
            index_retention: 500,
        }
    }
}

/// The terminal outcome a worker reports for one stack scan.
#[derive(Debug, Clone)]
pub enum StackOutcome {
    /// The evaluator ran; `drifted` says whether it found drift.
    Completed {
        /// Whether drift was detected.
        drifted: bool,
    },

    /// The evaluation failed.
    Failed {
        /// Human-readable failure reason.
        error: String,

        /// Whether the evaluator itself reported the failure (as opposed to
        /// infrastructure around it, e.g. the workspace copy).
        evaluator_error: bool,
    },
}

/// What [`Queue::progress`] did with a reported outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Counters advanced; the scan is still running.
    Advanced,

    /// Counters advanced and this report completed the scan.
    ScanFinished,

    /// The stack scan was no longer running (canceled underneath the
    /// worker); nothing was counted.
    Ignored,
}

/// Queue of scans and stack scans over a [`Broker`].
#[derive(Debug)]
pub struct Queue<B> {
    broker: Arc<B>,
    options: Options,
}

impl<B> Clone for Queue<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            options: self.options.clone(),
        }
    }
}

impl<B: Broker> Queue<B> {
    /// Create a queue over the provided broker.
    pub fn new(broker: Arc<B>, options: Options) -> Self {
        Self { broker, options }
    }

    /// The queue's lock TTL.
    pub fn lock_ttl(&self) -> Duration {
        self.options.lock_ttl
    }

    /// Start a scan: atomically acquire the per-repo lock and create the
    /// scan record, indexed under the repository.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::RepoLocked`] when another scan holds the lock;
    /// in that case no state was changed.
    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name()))]
    pub async fn start_scan(
        &self,
        repo: &RepoConfig,
        trigger: Trigger,
        commit: Option<String>,
        actor: &str,
    ) -> Result<Scan, Report<Error>> {
        let now = OffsetDateTime::now_utc();
        let scan = Scan {
            id: ScanId::generate(),
            repo: repo.name().clone(),
            trigger,
            commit,
            actor: String::from(actor),
            commit_sha: None,
            workspace: None,
            versions: ToolVersions::default(),
            status: ScanStatus::Running,
            error: None,
            counters: Counters::default(),
            created_at: now,
            started_at: Some(now),
            ended_at: None,
        };

        let acquired = self
            .broker
            .put_if_absent(&keys::lock(&scan.repo), scan.id.as_ref(), self.options.lock_ttl)
            .await
            .change_context(Error::Broker)?;
        if !acquired {
            return report!(Error::RepoLocked)
                .wrap_err()
                .attach_printable(format!("repo: {}", scan.repo));
        }

        self.broker
            .set_fields(&keys::scan(&scan.id), codec::scan_fields(&scan)?)
            .await
            .change_context(Error::Broker)?;
        self.broker
            .put(&keys::active(&scan.repo), scan.id.as_ref())
            .await
            .change_context(Error::Broker)?;
        self.broker
            .put(&keys::last(&scan.repo), scan.id.as_ref())
            .await
            .change_context(Error::Broker)?;

        self.publish_scan_event(&scan).await;
        debug!(scan_id = %scan.id, "started scan");
        Ok(scan)
    }

    /// Fetch a scan by id.
    pub async fn get_scan(&self, id: &ScanId) -> Result<Scan, Report<Error>> {
        let fields = self
            .broker
            .fields(&keys::scan(id))
            .await
            .change_context(Error::Broker)?;
        if fields.is_empty() {
            return report!(Error::ScanNotFound)
                .wrap_err()
                .attach_printable(format!("scan id: {id}"));
        }
        codec::scan_from_fields(&fields)
    }

    /// Fetch the repo's currently active scan.
    pub async fn get_active_scan(&self, repo: &RepoName) -> Result<Scan, Report<Error>> {
        self.get_pointer(&keys::active(repo)).await
    }

    /// Fetch the repo's most recently started scan, running or terminal.
    pub async fn get_last_scan(&self, repo: &RepoName) -> Result<Scan, Report<Error>> {
        self.get_pointer(&keys::last(repo)).await
    }

    async fn get_pointer(&self, pointer: &str) -> Result<Scan, Report<Error>> {
        let id = self
            .broker
            .get(pointer)
            .await
            .change_context(Error::Broker)?
            .ok_or_else(|| report!(Error::ScanNotFound))?;
        self.get_scan(&ScanId::from(id.as_str())).await
    }

    /// Fetch a stack scan by id.
    pub async fn get_stack_scan(&self, id: &StackScanId) -> Result<StackScan, Report<Error>> {
        let fields = self
            .broker
            .fields(&keys::stack(id))
            .await
            .change_context(Error::Broker)?;
        if fields.is_empty() {
            return report!(Error::StackScanNotFound)
                .wrap_err()
                .attach_printable(format!("stack scan id: {id}"));
        }
        codec::stack_from_fields(&fields)
    }

    /// Cancel a running scan: terminal status `Canceled`, every non-terminal
    /// stack scan canceled with it, lock released.
    ///
    /// Only the lock holder may be canceled; see [`Error::NotLockHolder`].
    #[tracing::instrument(skip(self))]
    pub async fn cancel_scan(
        &self,
        id: &ScanId,
        repo: &RepoName,
        reason: &str,
    ) -> Result<(), Report<Error>> {
        self.finish_scan(id, repo, ScanStatus::Canceled, reason).await
    }

    /// Fail a running scan: terminal status `Failed`, every non-terminal
    /// stack scan canceled, lock released.
    #[tracing::instrument(skip(self))]
    pub async fn fail_scan(
        &self,
        id: &ScanId,
        repo: &RepoName,
        reason: &str,
    ) -> Result<(), Report<Error>> {
        self.finish_scan(id, repo, ScanStatus::Failed, reason).await
    }

    async fn finish_scan(
        &self,
        id: &ScanId,
        repo: &RepoName,
        status: ScanStatus,
        reason: &str,
    ) -> Result<(), Report<Error>> {
        // A scan may only be finished by its owner. A missing lock is fine
        // (it expired); a lock held by another scan is not.
        let holder = self
            .broker
            .get(&keys::lock(repo))
            .await
            .change_context(Error::Broker)?;
        if let Some(holder) = holder {
            if holder != id.as_ref() {
                return report!(Error::NotLockHolder)
                    .wrap_err()
                    .attach_printable(format!("lock holder: {holder}, caller: {id}"));
            }
        }

        let now = OffsetDateTime::now_utc();
        let finished = self
            .broker
            .set_fields_if_equal(
                &keys::scan(id),
                codec::running_guard(),
                vec![
                    (fields::STATUS.into(), status.to_string()),
                    (fields::ERROR.into(), String::from(reason)),
                    (fields::ENDED_AT.into(), now.unix_timestamp().to_string()),
                ],
            )
            .await
            .change_context(Error::Broker)?;

        if finished {
            self.cancel_pending_stacks(id).await?;
            if let Ok(scan) = self.get_scan(id).await {
                self.publish_scan_event(&scan).await;
            }
            self.retire_scan(id, repo).await?;
        }
        Ok(())
    }

    /// Cancel every non-terminal stack scan of a scan, publishing each change.
    async fn cancel_pending_stacks(&self, id: &ScanId) -> Result<(), Report<Error>> {
        let now = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let members = self
            .broker
            .index_desc(&keys::scan_stacks(id), MAX_STACKS_PER_SCAN)
            .await
            .change_context(Error::Broker)?;

        for member in members {
            let stack_id = StackScanId::from(member.as_str());
            let key = keys::stack(&stack_id);
            let cancel_fields = vec![
                (fields::STATUS.into(), StackStatus::Canceled.to_string()),
                (fields::COMPLETED_AT.into(), now.clone()),
            ];
            let mut canceled = self
                .broker
                .set_fields_if_equal(
                    &key,
                    (fields::STATUS, codec::PENDING),
                    cancel_fields.clone(),
                )
                .await
                .change_context(Error::Broker)?;
            if !canceled {
                canceled = self
                    .broker
                    .set_fields_if_equal(&key, (fields::STATUS, codec::RUNNING), cancel_fields)
                    .await
                    .change_context(Error::Broker)?;
            }
            if canceled {
                if let Ok(stack) = self.get_stack_scan(&stack_id).await {
                    self.publish_stack_event(&stack).await;
                }
            }
        }
        Ok(())
    }

    /// Post-terminal bookkeeping: drop the active pointer, release the lock,
    /// and put eviction TTLs on the scan's records.
    async fn retire_scan(&self, id: &ScanId, repo: &RepoName) -> Result<(), Report<Error>> {
        self.broker
            .remove_if_equal(&keys::active(repo), id.as_ref())
            .await
            .change_context(Error::Broker)?;
        self.release_scan_lock(repo, id).await?;

        let ttl = self.options.record_ttl;
        self.broker
            .expire(&keys::scan(id), ttl)
            .await
            .change_context(Error::Broker)?;
        self.broker
            .expire(&keys::scan_stacks(id), ttl)
            .await
            .change_context(Error::Broker)?;
        let members = self
            .broker
            .index_desc(&keys::scan_stacks(id), MAX_STACKS_PER_SCAN)
            .await
            .change_context(Error::Broker)?;
        for member in members {
            self.broker
                .expire(&keys::stack(&StackScanId::from(member.as_str())), ttl)
                .await
                .change_context(Error::Broker)?;
        }
        Ok(())
    }

    /// Keep the scan lock alive until the scan goes terminal.
    ///
    /// Extends the lock TTL every `interval`, stopping when the scan is
    /// terminal, the lock is lost, or `max_age` has elapsed. A scan past
    /// `max_age` is considered stuck: the lock is left to expire so a later
    /// trigger can take the repository over.
    #[tracing::instrument(skip(self))]
    pub async fn renew_scan_lock(
        &self,
        id: &ScanId,
        repo: &RepoName,
        max_age: Duration,
        interval: Duration,
    ) -> Result<(), Report<Error>> {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(interval).await;
            if started.elapsed() > max_age {
                warn!(scan_id = %id, "scan exceeded max age; letting lock expire");
                return Ok(());
            }
            match self.get_scan(id).await {
                Ok(scan) if scan.status.is_terminal() => return Ok(()),
                Ok(_) => {}
                Err(err) if matches!(err.current_context(), Error::ScanNotFound) => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            let renewed = self
                .broker
                .extend_if_equal(&keys::lock(repo), id.as_ref(), self.options.lock_ttl)
                .await
                .change_context(Error::Broker)?;
            if !renewed {
                warn!(scan_id = %id, "scan lock lost; stopping renewal");
                return Ok(());
            }
        }
    }

    /// Release the repo lock iff it is held by the given scan.
    pub async fn release_scan_lock(
        &self,
        repo: &RepoName,
        id: &ScanId,
    ) -> Result<bool, Report<Error>> {
        self.broker
            .remove_if_equal(&keys::lock(repo), id.as_ref())
            .await
            .change_context(Error::Broker)
    }

    /// Record the scan's workspace checkout and resolved commit.
    pub async fn set_scan_workspace(
        &self,
        id: &ScanId,
        path: &str,
        commit_sha: &str,
    ) -> Result<(), Report<Error>> {
        self.broker
            .set_fields(
                &keys::scan(id),
                vec![
                    (fields::WORKSPACE.into(), String::from(path)),
                    (fields::COMMIT_SHA.into(), String::from(commit_sha)),
                ],
            )
            .await
            .change_context(Error::Broker)
    }

    /// Record the tool versions detected for the scan.
    pub async fn set_scan_versions(
        &self,
        id: &ScanId,
        versions: &ToolVersions,
    ) -> Result<(), Report<Error>> {
        let encoded = serde_json::to_string(versions).context(Error::Encode)?;
        self.broker
            .set_fields(&keys::scan(id), vec![(fields::VERSIONS.into(), encoded)])
            .await
            .change_context(Error::Broker)
    }

    /// Record the number of stacks selected for the scan.
    pub async fn set_scan_total(&self, id: &ScanId, total: usize) -> Result<(), Report<Error>> {
        self.broker
            .set_fields(
                &keys::scan(id),
                vec![(fields::TOTAL.into(), total.to_string())],
            )
            .await
            .change_context(Error::Broker)
    }

    /// Count a stack the orchestrator skipped because a prior stack scan was inflight.
    pub async fn mark_enqueue_skipped(&self, id: &ScanId) -> Result<(), Report<Error>> {
        self.broker
            .incr_fields(&keys::scan(id), vec![(fields::ENQUEUE_SKIPPED.into(), 1)])
            .await
            .change_context(Error::Broker)
            .map(|_| ())
    }

    /// Count a stack the orchestrator failed to enqueue.
    pub async fn mark_enqueue_failed(&self, id: &ScanId) -> Result<(), Report<Error>> {
        self.broker
            .incr_fields(&keys::scan(id), vec![(fields::ENQUEUE_FAILED.into(), 1)])
            .await
            .change_context(Error::Broker)
            .map(|_| ())
    }

    /// Persist a stack scan and append it to the worker queue.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::StackScanInflight`] when a non-terminal stack scan
    /// already exists for the same scan and stack path; no state is changed.
    #[tracing::instrument(skip(self, stack_scan), fields(id = %stack_scan.id))]
    pub async fn enqueue(&self, stack_scan: StackScan) -> Result<(), Report<Error>> {
        let key = keys::stack(&stack_scan.id);
        let existing = self
            .broker
            .fields(&key)
            .await
            .change_context(Error::Broker)?;
        if let Some(raw) = existing.get(fields::STATUS) {
            let status = StackStatus::from_str(raw)
                .context_lazy(|| Error::Decode(format!("stack status '{raw}'")))?;
            if !status.is_terminal() {
                return report!(Error::StackScanInflight)
                    .wrap_err()
                    .attach_printable(format!("stack scan id: {}", stack_scan.id));
            }
        }

        let score = stack_scan.created_at.unix_timestamp() as f64;
        self.broker
            .set_fields(&key, codec::stack_fields(&stack_scan))
            .await
            .change_context(Error::Broker)?;
        self.broker
            .index_put(
                &keys::scan_stacks(&stack_scan.scan_id),
                stack_scan.id.as_ref(),
                score,
            )
            .await
            .change_context(Error::Broker)?;
        self.broker
            .index_put(&keys::repo_stacks(&stack_scan.repo), stack_scan.id.as_ref(), score)
            .await
            .change_context(Error::Broker)?;
        self.broker
            .index_trim(
                &keys::repo_stacks(&stack_scan.repo),
                self.options.index_retention,
            )
            .await
            .change_context(Error::Broker)?;
        self.broker
            .push_back(WORK_QUEUE, stack_scan.id.as_ref())
            .await
            .change_context(Error::Broker)?;
        self.broker
            .incr_fields(&keys::scan(&stack_scan.scan_id), vec![(fields::QUEUED.into(), 1)])
            .await
            .change_context(Error::Broker)?;

        self.publish_stack_event(&stack_scan).await;
        Ok(())
    }

    /// Pop the next stack scan for a worker, waiting up to `wait`.
    ///
    /// Returns `None` on timeout or when the popped id no longer resolves to
    /// a record (evicted while queued); workers just loop.
    pub async fn claim(&self, wait: Duration) -> Result<Option<StackScan>, Report<Error>> {
        let Some(id) = self
            .broker
            .pop_front(WORK_QUEUE, wait)
            .await
            .change_context(Error::Broker)?
        else {
            return Ok(None);
        };

        match self.get_stack_scan(&StackScanId::from(id.as_str())).await {
            Ok(stack) => Ok(Some(stack)),
            Err(err) if matches!(err.current_context(), Error::StackScanNotFound) => {
                debug!(stack_scan_id = %id, "claimed id with no record; dropping");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Transition a claimed stack scan to running.
    ///
    /// Returns the updated record, or `None` when the stack scan was no
    /// longer pending (canceled while queued), in which case the worker must
    /// drop it without touching counters.
    pub async fn mark_stack_running(
        &self,
        stack_scan: &StackScan,
    ) -> Result<Option<StackScan>, Report<Error>> {
        let now = OffsetDateTime::now_utc();
        let claimed = self
            .broker
            .set_fields_if_equal(
                &keys::stack(&stack_scan.id),
                (fields::STATUS, codec::PENDING),
                vec![
                    (fields::STATUS.into(), StackStatus::Running.to_string()),
                    (fields::STARTED_AT.into(), now.unix_timestamp().to_string()),
                ],
            )
            .await
            .change_context(Error::Broker)?;
        if !claimed {
            return Ok(None);
        }

        self.broker
            .incr_fields(
                &keys::scan(&stack_scan.scan_id),
                vec![(fields::QUEUED.into(), -1), (fields::RUNNING.into(), 1)],
            )
            .await
            .change_context(Error::Broker)?;

        let updated = self.get_stack_scan(&stack_scan.id).await?;
        self.publish_stack_event(&updated).await;
        if let Ok(scan) = self.get_scan(&stack_scan.scan_id).await {
            self.publish_scan_event(&scan).await;
        }
        Ok(Some(updated))
    }

    /// Record a stack scan's terminal outcome and advance the parent scan.
    ///
    /// The counter increments are a single atomic broker operation that
    /// returns the post-increment counters, so exactly one reporter observes
    /// `completed + failed == total` and flips the scan terminal. The flip
    /// itself is guarded on the scan still being `running`, which keeps a
    /// racing cancellation authoritative.
    #[tracing::instrument(skip(self, stack_scan), fields(id = %stack_scan.id))]
    pub async fn progress(
        &self,
        stack_scan: &StackScan,
        outcome: StackOutcome,
    ) -> Result<ProgressOutcome, Report<Error>> {
        let now = OffsetDateTime::now_utc();
        let (status, error, deltas) = match &outcome {
            StackOutcome::Completed { drifted } => {
                let mut deltas = vec![
                    (String::from(fields::RUNNING), -1),
                    (String::from(fields::COMPLETED), 1),
                ];
                if *drifted {
                    deltas.push((String::from(fields::DRIFTED), 1));
                }
                (StackStatus::Completed, None, deltas)
            }
            StackOutcome::Failed {
                error,
                evaluator_error,
            } => {
                let mut deltas = vec![
                    (String::from(fields::RUNNING), -1),
                    (String::from(fields::FAILED), 1),
                ];
                if *evaluator_error {
                    deltas.push((String::from(fields::ERRORED), 1));
                }
                (StackStatus::Failed, Some(error.clone()), deltas)
            }
        };

        let mut stack_fields = vec![
            (String::from(fields::STATUS), status.to_string()),
            (
                String::from(fields::COMPLETED_AT),
                now.unix_timestamp().to_string(),
            ),
        ];
        if let Some(error) = &error {
            stack_fields.push((String::from(fields::ERROR), error.clone()));
        }

        let recorded = self
            .broker
            .set_fields_if_equal(
                &keys::stack(&stack_scan.id),
                (fields::STATUS, codec::RUNNING),
                stack_fields,
            )
            .await
            .change_context(Error::Broker)?;
        if !recorded {
            // Canceled underneath the worker; cancellation owns the counters.
            return Ok(ProgressOutcome::Ignored);
        }

        if let Ok(updated) = self.get_stack_scan(&stack_scan.id).await {
            self.publish_stack_event(&updated).await;
        }

        let after = self
            .broker
            .incr_fields(&keys::scan(&stack_scan.scan_id), deltas)
            .await
            .change_context(Error::Broker)?;

        let total = codec::parse_count(&after, fields::TOTAL);
        let completed = codec::parse_count(&after, fields::COMPLETED);
        let failed = codec::parse_count(&after, fields::FAILED);

        if total >= 1 && completed + failed >= total {
            // An error recorded before terminal reconciliation fails the scan.
            let error_present = after
                .get(fields::ERROR)
                .map_or(false, |raw| !raw.is_empty());
            let final_status = if error_present {
                ScanStatus::Failed
            } else {
                ScanStatus::Completed
            };
            let flipped = self
                .broker
                .set_fields_if_equal(
                    &keys::scan(&stack_scan.scan_id),
                    codec::running_guard(),
                    vec![
                        (String::from(fields::STATUS), final_status.to_string()),
                        (
                            String::from(fields::ENDED_AT),
                            now.unix_timestamp().to_string(),
                        ),
                    ],
                )
                .await
                .change_context(Error::Broker)?;
            if flipped {
                if let Ok(scan) = self.get_scan(&stack_scan.scan_id).await {
                    self.publish_scan_event(&scan).await;
                }
                self.retire_scan(&stack_scan.scan_id, &stack_scan.repo).await?;
                return Ok(ProgressOutcome::ScanFinished);
            }
            return Ok(ProgressOutcome::Advanced);
        }

        if let Ok(scan) = self.get_scan(&stack_scan.scan_id).await {
            self.publish_scan_event(&scan).await;
        }
        Ok(ProgressOutcome::Advanced)
    }

    /// Put a failed stack scan back on the queue with its retry count bumped.
    ///
    /// Returns whether the requeue happened; it doesn't when the stack scan
    /// was canceled underneath the worker.
    pub async fn requeue_retry(
        &self,
        stack_scan: &StackScan,
        error: &str,
    ) -> Result<bool, Report<Error>> {
        let requeued = self
            .broker
            .set_fields_if_equal(
                &keys::stack(&stack_scan.id),
                (fields::STATUS, codec::RUNNING),
                vec![
                    (String::from(fields::STATUS), StackStatus::Pending.to_string()),
                    (
                        String::from(fields::RETRIES),
                        (stack_scan.retries + 1).to_string(),
                    ),
                    (String::from(fields::ERROR), String::from(error)),
                ],
            )
            .await
            .change_context(Error::Broker)?;
        if !requeued {
            return Ok(false);
        }

        self.broker
            .incr_fields(
                &keys::scan(&stack_scan.scan_id),
                vec![(String::from(fields::RUNNING), -1), (String::from(fields::QUEUED), 1)],
            )
            .await
            .change_context(Error::Broker)?;
        self.broker
            .push_back(WORK_QUEUE, stack_scan.id.as_ref())
            .await
            .change_context(Error::Broker)?;

        if let Ok(updated) = self.get_stack_scan(&stack_scan.id).await {
            self.publish_stack_event(&updated).await;
        }
        Ok(true)
    }

    /// List a repo's most recent stack scans, newest first.
    pub async fn list_repo_stack_scans(
        &self,
        repo: &RepoName,
        limit: usize,
    ) -> Result<Vec<StackScan>, Report<Error>> {
        let members = self
            .broker
            .index_desc(&keys::repo_stacks(repo), limit)
            .await
            .change_context(Error::Broker)?;
        let mut listed = Vec::with_capacity(members.len());
        for member in members {
            match self.get_stack_scan(&StackScanId::from(member.as_str())).await {
                Ok(stack) => listed.push(stack),
                // Evicted records fall out of the listing silently.
                Err(err) if matches!(err.current_context(), Error::StackScanNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(listed)
    }

    /// Publish a scan state change on the repo's event channel.
    ///
    /// Event delivery is best-effort; a publish failure is logged, never
    /// propagated, because subscribers re-sync from snapshots anyway.
    pub async fn publish_scan_event(&self, scan: &Scan) {
        let event = RepoEvent::ScanUpdate { scan: scan.clone() };
        self.publish_event(&event).await;
    }

    /// Publish a stack scan state change on the repo's event channel.
    pub async fn publish_stack_event(&self, stack_scan: &StackScan) {
        let event = RepoEvent::StackUpdate {
            stack_scan: stack_scan.clone(),
        };
        self.publish_event(&event).await;
    }

    async fn publish_event(&self, event: &RepoEvent) {
        let channel = keys::events(event.repo());
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode event for '{channel}': {err}");
                return;
            }
        };
        if let Err(err) = self.broker.publish(&channel, &payload).await {
            warn!("failed to publish event on '{channel}': {err:?}");
        }
    }

    /// Subscribe to a repo's event channel.
    pub async fn subscribe(
        &self,
        repo: &RepoName,
    ) -> Result<Box<dyn Subscription>, Report<Error>> {
        self.broker
            .subscribe(&keys::events(repo))
            .await
            .change_context(Error::Broker)
    }
}

/// Construct a pending stack scan for enqueueing, inheriting the scan's
/// trigger metadata.
pub fn stack_scan_for(scan: &Scan, repo_url: &str, stack: StackPath, max_retries: u32) -> StackScan {
    StackScan {
        id: StackScanId::derive(&scan.id, &stack),
        scan_id: scan.id.clone(),
        repo: scan.repo.clone(),
        repo_url: String::from(repo_url),
        stack,
        status: StackStatus::Pending,
        retries: 0,
        max_retries,
        error: None,
        trigger: scan.trigger,
        commit: scan.commit.clone(),
        actor: scan.actor.clone(),
        created_at: OffsetDateTime::now_utc(),
        started_at: None,
        completed_at: None,
    }
}

mod fields {
    //! Hash field names shared by the scan and stack scan encodings.

    pub const ID: &str = "id";
    pub const REPO: &str = "repo";
    pub const REPO_URL: &str = "repo_url";
    pub const SCAN_ID: &str = "scan_id";
    pub const STACK: &str = "stack";
    pub const TRIGGER: &str = "trigger";
    pub const COMMIT: &str = "commit";
    pub const ACTOR: &str = "actor";
    pub const COMMIT_SHA: &str = "commit_sha";
    pub const WORKSPACE: &str = "workspace";
    pub const VERSIONS: &str = "versions";
    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";
    pub const RETRIES: &str = "retries";
    pub const MAX_RETRIES: &str = "max_retries";
    pub const CREATED_AT: &str = "created_at";
    pub const STARTED_AT: &str = "started_at";
    pub const ENDED_AT: &str = "ended_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const TOTAL: &str = "total";
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const DRIFTED: &str = "drifted";
    pub const ERRORED: &str = "errored";
    pub const ENQUEUE_SKIPPED: &str = "enqueue_skipped";
    pub const ENQUEUE_FAILED: &str = "enqueue_failed";
}

mod codec {
    //! Broker hash encoding of scans and stack scans.

    use super::*;

    /// The `running` status literal as written to the broker, shared by
    /// scans and stack scans.
    pub const RUNNING: &str = "running";

    /// The `pending` status literal as written to the broker.
    pub const PENDING: &str = "pending";

    /// Guard tuple asserting a scan is still running.
    pub fn running_guard() -> (&'static str, &'static str) {
        (fields::STATUS, RUNNING)
    }

    pub fn scan_fields(scan: &Scan) -> Result<Vec<(String, String)>, Report<Error>> {
        let versions = serde_json::to_string(&scan.versions).context(Error::Encode)?;
        let mut out = vec![
            (fields::ID.into(), scan.id.as_ref().into()),
            (fields::REPO.into(), scan.repo.as_ref().into()),
            (fields::TRIGGER.into(), scan.trigger.to_string()),
            (fields::ACTOR.into(), scan.actor.clone()),
            (fields::STATUS.into(), scan.status.to_string()),
            (fields::VERSIONS.into(), versions),
            (
                fields::CREATED_AT.into(),
                scan.created_at.unix_timestamp().to_string(),
            ),
            (fields::TOTAL.into(), scan.counters.total.to_string()),
            (fields::QUEUED.into(), scan.counters.queued.to_string()),
            (fields::RUNNING.into(), scan.counters.running.to_string()),
            (fields::COMPLETED.into(), scan.counters.completed.to_string()),
            (fields::FAILED.into(), scan.counters.failed.to_string()),
            (fields::DRIFTED.into(), scan.counters.drifted.to_string()),
            (fields::ERRORED.into(), scan.counters.errored.to_string()),
        ];
        if let Some(commit) = &scan.commit {
            out.push((fields::COMMIT.into(), commit.clone()));
        }
        if let Some(sha) = &scan.commit_sha {
            out.push((fields::COMMIT_SHA.into(), sha.clone()));
        }
        if let Some(workspace) = &scan.workspace {
            out.push((fields::WORKSPACE.into(), workspace.clone()));
        }
        if let Some(error) = &scan.error {
            out.push((fields::ERROR.into(), error.clone()));
        }
        if let Some(at) = scan.started_at {
            out.push((fields::STARTED_AT.into(), at.unix_timestamp().to_string()));
        }
        if let Some(at) = scan.ended_at {
            out.push((fields::ENDED_AT.into(), at.unix_timestamp().to_string()));
        }
        Ok(out)
    }

    pub fn scan_from_fields(map: &HashMap<String, String>) -> Result<Scan, Report<Error>> {
        let counters = Counters {
            total: parse_count(map, fields::TOTAL),
            queued: parse_count(map, fields::QUEUED),
            running: parse_count(map, fields::RUNNING),
            completed: parse_count(map, fields::COMPLETED),
            failed: parse_count(map, fields::FAILED),
            drifted: parse_count(map, fields::DRIFTED),
            errored: parse_count(map, fields::ERRORED),
            enqueue_skipped: parse_count(map, fields::ENQUEUE_SKIPPED),
            enqueue_failed: parse_count(map, fields::ENQUEUE_FAILED),
        };
        let versions = match map.get(fields::VERSIONS) {
            Some(raw) => serde_json::from_str(raw)
                .context_lazy(|| Error::Decode(format!("versions '{raw}'")))?,
            None => ToolVersions::default(),
        };

        Scan {
            id: ScanId::from(required(map, fields::ID)?.as_str()),
            repo: parse_repo(map)?,
            trigger: parse_trigger(map)?,
            commit: map.get(fields::COMMIT).cloned(),
            actor: map.get(fields::ACTOR).cloned().unwrap_or_default(),
            commit_sha: map.get(fields::COMMIT_SHA).cloned(),
            workspace: map.get(fields::WORKSPACE).cloned(),
            versions,
            status: parse_status(map)?,
            error: map.get(fields::ERROR).filter(|e| !e.is_empty()).cloned(),
            counters,
            created_at: parse_timestamp(map, fields::CREATED_AT)?,
            started_at: parse_timestamp_opt(map, fields::STARTED_AT)?,
            ended_at: parse_timestamp_opt(map, fields::ENDED_AT)?,
        }
        .wrap_ok()
    }

    pub fn stack_fields(stack: &StackScan) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.into(), stack.id.as_ref().into()),
            (fields::SCAN_ID.into(), stack.scan_id.as_ref().into()),
            (fields::REPO.into(), stack.repo.as_ref().into()),
            (fields::REPO_URL.into(), stack.repo_url.clone()),
            (fields::STACK.into(), stack.stack.as_ref().into()),
            (fields::STATUS.into(), stack.status.to_string()),
            (fields::TRIGGER.into(), stack.trigger.to_string()),
            (fields::ACTOR.into(), stack.actor.clone()),
            (fields::RETRIES.into(), stack.retries.to_string()),
            (fields::MAX_RETRIES.into(), stack.max_retries.to_string()),
            (
                fields::CREATED_AT.into(),
                stack.created_at.unix_timestamp().to_string(),
            ),
        ];
        if let Some(commit) = &stack.commit {
            out.push((fields::COMMIT.into(), commit.clone()));
        }
        if let Some(error) = &stack.error {
            out.push((fields::ERROR.into(), error.clone()));
        }
        if let Some(at) = stack.started_at {
            out.push((fields::STARTED_AT.into(), at.unix_timestamp().to_string()));
        }
        if let Some(at) = stack.completed_at {
            out.push((fields::COMPLETED_AT.into(), at.unix_timestamp().to_string()));
        }
        out
    }

    pub fn stack_from_fields(map: &HashMap<String, String>) -> Result<StackScan, Report<Error>> {
        let stack_raw = map.get(fields::STACK).cloned().unwrap_or_default();
        let stack = StackPath::try_from(stack_raw.clone())
            .change_context_lazy(|| Error::Decode(format!("stack path '{stack_raw}'")))?;

        StackScan {
            id: StackScanId::from(required(map, fields::ID)?.as_str()),
            scan_id: ScanId::from(required(map, fields::SCAN_ID)?.as_str()),
            repo: parse_repo(map)?,
            repo_url: map.get(fields::REPO_URL).cloned().unwrap_or_default(),
            stack,
            status: parse_stack_status(map)?,
            retries: parse_count(map, fields::RETRIES) as u32,
            max_retries: parse_count(map, fields::MAX_RETRIES) as u32,
            error: map.get(fields::ERROR).filter(|e| !e.is_empty()).cloned(),
            trigger: parse_trigger(map)?,
            commit: map.get(fields::COMMIT).cloned(),
            actor: map.get(fields::ACTOR).cloned().unwrap_or_default(),
            created_at: parse_timestamp(map, fields::CREATED_AT)?,
            started_at: parse_timestamp_opt(map, fields::STARTED_AT)?,
            completed_at: parse_timestamp_opt(map, fields::COMPLETED_AT)?,
        }
        .wrap_ok()
    }

    pub fn parse_count(map: &HashMap<String, String>, field: &str) -> i64 {
        map.get(field)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0)
    }

    fn required<'a>(
        map: &'a HashMap<String, String>,
        field: &str,
    ) -> Result<&'a String, Report<Error>> {
        map.get(field)
            .ok_or_else(|| report!(Error::Decode(format!("missing field '{field}'"))))
    }

    fn parse_repo(map: &HashMap<String, String>) -> Result<RepoName, Report<Error>> {
        let raw = required(map, fields::REPO)?;
        RepoName::try_from(raw.clone())
            .change_context_lazy(|| Error::Decode(format!("repo name '{raw}'")))
    }

    fn parse_trigger(map: &HashMap<String, String>) -> Result<Trigger, Report<Error>> {
        let raw = required(map, fields::TRIGGER)?;
        Trigger::from_str(raw).context_lazy(|| Error::Decode(format!("trigger '{raw}'")))
    }

    fn parse_status(map: &HashMap<String, String>) -> Result<ScanStatus, Report<Error>> {
        let raw = required(map, fields::STATUS)?;
        ScanStatus::from_str(raw).context_lazy(|| Error::Decode(format!("scan status '{raw}'")))
    }

    fn parse_stack_status(map: &HashMap<String, String>) -> Result<StackStatus, Report<Error>> {
        let raw = required(map, fields::STATUS)?;
        StackStatus::from_str(raw)
            .context_lazy(|| Error::Decode(format!("stack status '{raw}'")))
    }

    fn parse_timestamp(
        map: &HashMap<String, String>,
        field: &str,
    ) -> Result<OffsetDateTime, Report<Error>> {
        let raw = required(map, field)?;
        let seconds = raw
            .parse::<i64>()
            .context_lazy(|| Error::Decode(format!("timestamp '{raw}'")))?;
        OffsetDateTime::from_unix_timestamp(seconds)
            .context_lazy(|| Error::Decode(format!("timestamp '{raw}'")))
    }

    fn parse_timestamp_opt(
        map: &HashMap<String, String>,
        field: &str,
    ) -> Result<Option<OffsetDateTime>, Report<Error>> {
        match map.get(field) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(_) => parse_timestamp(map, field).map(Some),
        }
    }
}

mod keys {
    //! Broker key construction.

    use super::*;

    pub fn scan(id: &ScanId) -> String {
        format!("scan:{id}")
    }

    pub fn active(repo: &RepoName) -> String {
        format!("scan:repo:{repo}")
    }

    pub fn last(repo: &RepoName) -> String {
        format!("scan:last:{repo}")
    }

    pub fn scan_stacks(id: &ScanId) -> String {
        format!("scan:stack_scans:{id}")
    }

    pub fn stack(id: &StackScanId) -> String {
        format!("stack:{id}")
    }

    pub fn repo_stacks(repo: &RepoName) -> String {
        format!("stack:repo:{repo}")
    }

    pub fn lock(repo: &RepoName) -> String {
        format!("lock:repo:{repo}")
    }

    pub fn events(repo: &RepoName) -> String {
        format!("events:{repo}")
    }
}
