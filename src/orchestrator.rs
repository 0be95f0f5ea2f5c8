//! The scan orchestrator: everything between "something asked for a scan"
//! and "stack scans are on the queue".
//!
//! One entry point per trigger shape: [`Orchestrator::start_and_enqueue`]
//! scans every discovered stack; [`Orchestrator::start_for_changes`] is the
//! webhook variant that scans only stacks touched by a changed-file set.

use std::sync::Arc;
use std::time::Duration;

use error_stack::{report, Report, ResultExt};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::discover;
use crate::ext::result::WrapErr;
use crate::ext::tracing::span_record;
use crate::git;
use crate::queue::{self, Queue};
use crate::repo::RepoConfig;
use crate::scan::{Scan, StackScanId, Trigger};
use crate::workspace::Workspaces;

/// The reason recorded on a scan canceled by supersession.
pub const SUPERSEDED_REASON: &str = "superseded by new trigger";

/// Errors encountered while orchestrating a scan.
///
/// `RepoLocked`, `NoStacksEnqueued` and `NoMatchingStacks` are boundary
/// sentinels; callers match on them for flow control.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another scan holds the repository and was not (or could not be) preempted.
    #[error("repository scan already in flight")]
    RepoLocked,

    /// Cloning the repository failed; the scan was failed.
    #[error("clone repository")]
    Clone,

    /// The checkout contains no IaC stacks; the scan was failed.
    #[error("no stacks discovered")]
    NoStacksDiscovered,

    /// Reading version pins failed; the scan was failed.
    #[error("detect tool versions")]
    DetectVersions,

    /// Every stack was skipped at enqueue time; the scan was canceled.
    #[error("no stacks enqueued")]
    NoStacksEnqueued,

    /// A webhook's changed files touch no discovered stack; the scan was failed.
    #[error("no stacks match the webhook changes")]
    NoMatchingStacks,

    /// A queue operation failed outside the paths above.
    #[error("queue operation")]
    Queue,
}

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct Options {
    /// Retry budget stamped on each stack scan.
    pub max_retries: u32,

    /// How long a scan may run before its lock is allowed to lapse.
    pub scan_max_age: Duration,

    /// How often the scan lock is renewed. Must be well under the lock TTL;
    /// a third or less tolerates transient broker failures.
    pub renew_every: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_retries: 1,
            scan_max_age: Duration::from_secs(2 * 60 * 60),
            renew_every: Duration::from_secs(15),
        }
    }
}

/// What the enqueue phase produced.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    /// Stack scans placed on the queue, in enqueue order.
    pub enqueued: Vec<StackScanId>,

    /// Stacks skipped because a prior stack scan was still inflight.
    pub skipped: usize,

    /// Messages for stacks that failed to enqueue.
    pub failures: Vec<String>,
}

/// Drives scans from trigger to enqueued work.
#[derive(Debug)]
pub struct Orchestrator<B> {
    queue: Arc<Queue<B>>,
    workspaces: Workspaces,
    options: Options,
}

impl<B: Broker> Orchestrator<B> {
    /// Create an orchestrator.
    pub fn new(queue: Arc<Queue<B>>, workspaces: Workspaces, options: Options) -> Self {
        Self {
            queue,
            workspaces,
            options,
        }
    }

    /// Start a scan of every stack in the repository and enqueue the work.
    ///
    /// Returns the scan as it stands after enqueueing, plus the enqueue
    /// accounting. On any failure after the scan was created, the scan has
    /// already been moved to a terminal state before this returns.
    #[tracing::instrument(skip(self, repo), fields(repo = %repo.name(), scan_id, commit_sha))]
    pub async fn start_and_enqueue(
        &self,
        repo: &RepoConfig,
        trigger: Trigger,
        commit: Option<String>,
        actor: &str,
    ) -> Result<(Scan, EnqueueOutcome), Report<Error>> {
        let scan = self.start_with_preemption(repo, trigger, commit, actor).await?;
        let outcome = self.enqueue_phase(repo, &scan, None).await?;
        let scan = self
            .queue
            .get_scan(&scan.id)
            .await
            .change_context(Error::Queue)?;
        Ok((scan, outcome))
    }

    /// Webhook variant: scan only the stacks touched by `changed` files.
    ///
    /// Returns `Ok(None)` without creating a scan when the changed set
    /// contains no infrastructure files at all; webhooks for unrelated
    /// commits are acknowledged and dropped.
    #[tracing::instrument(skip(self, repo, changed), fields(repo = %repo.name(), scan_id, commit_sha))]
    pub async fn start_for_changes(
        &self,
        repo: &RepoConfig,
        commit: Option<String>,
        actor: &str,
        changed: &[String],
    ) -> Result<Option<(Scan, EnqueueOutcome)>, Report<Error>> {
        if !changed.iter().any(|file| discover::is_infra_file(file)) {
            info!("webhook changes contain no infrastructure files; skipping");
            return Ok(None);
        }

        let scan = self
            .start_with_preemption(repo, Trigger::Webhook, commit, actor)
            .await?;
        let outcome = self.enqueue_phase(repo, &scan, Some(changed)).await?;
        let scan = self
            .queue
            .get_scan(&scan.id)
            .await
            .change_context(Error::Queue)?;
        Ok(Some((scan, outcome)))
    }

    /// Start a scan, preempting the active one when the repository allows it
    /// and the new trigger's priority is at least the active one's.
    ///
    /// A lower-priority trigger never preempts a higher one, and a failed
    /// start has no side effects, so redelivered triggers are harmless.
    async fn start_with_preemption(
        &self,
        repo: &RepoConfig,
        trigger: Trigger,
        commit: Option<String>,
        actor: &str,
    ) -> Result<Scan, Report<Error>> {
        let first = self
            .queue
            .start_scan(repo, trigger, commit.clone(), actor)
            .await;
        let err = match first {
            Ok(scan) => {
                self.spawn_renewal(&scan);
                span_record!(scan_id, display scan.id);
                return Ok(scan);
            }
            Err(err) => err,
        };
        if !matches!(err.current_context(), queue::Error::RepoLocked) {
            return Err(err.change_context(Error::Queue));
        }
        if !repo.cancel_inflight_on_new_trigger() {
            return Err(err.change_context(Error::RepoLocked));
        }

        match self.queue.get_active_scan(repo.name()).await {
            Ok(active) => {
                if trigger < active.trigger {
                    debug!(
                        "active {} trigger outranks new {} trigger; not preempting",
                        active.trigger, trigger
                    );
                    return Err(err.change_context(Error::RepoLocked));
                }
                info!(active_scan = %active.id, "preempting active scan");
                self.queue
                    .cancel_scan(&active.id, repo.name(), SUPERSEDED_REASON)
                    .await
                    .change_context(Error::Queue)?;
            }
            // The lock exists but its scan record is gone; the cancel below
            // has nothing to do and the retry settles it.
            Err(err) if matches!(err.current_context(), queue::Error::ScanNotFound) => {}
            Err(err) => return Err(err.change_context(Error::Queue)),
        }

        let scan = self
            .queue
            .start_scan(repo, trigger, commit, actor)
            .await
            .map_err(|err| {
                if matches!(err.current_context(), queue::Error::RepoLocked) {
                    err.change_context(Error::RepoLocked)
                } else {
                    err.change_context(Error::Queue)
                }
            })?;
        self.spawn_renewal(&scan);
        span_record!(scan_id, display scan.id);
        Ok(scan)
    }

    /// Keep the scan lock alive in the background until the scan is terminal.
    ///
    /// The renewal task's lifetime is bound to the scan, never to the inbound
    /// request: triggers come and go, the lock has to outlive them all.
    fn spawn_renewal(&self, scan: &Scan) {
        let queue = Arc::clone(&self.queue);
        let id = scan.id.clone();
        let repo = scan.repo.clone();
        let max_age = self.options.scan_max_age;
        let every = self.options.renew_every;
        tokio::spawn(async move {
            if let Err(err) = queue.renew_scan_lock(&id, &repo, max_age, every).await {
                warn!(scan_id = %id, "lock renewal stopped with error: {err:?}");
            }
        });
    }

    /// Steps 3..11: clone, discover, version-detect, enqueue.
    async fn enqueue_phase(
        &self,
        repo: &RepoConfig,
        scan: &Scan,
        changed: Option<&[String]>,
    ) -> Result<EnqueueOutcome, Report<Error>> {
        let checkout = match self.workspaces.prepare(repo.name(), &scan.id).await {
            Ok(checkout) => checkout,
            Err(err) => return self.fail_with(scan, Error::Clone, &format!("{err}")).await,
        };

        let spec = git::CloneSpec {
            url: repo.url().to_string(),
            branch: repo.branch().clone(),
            auth: repo.git().clone(),
        };
        let commit_sha = match git::clone_repo(&spec, &checkout).await {
            Ok(sha) => sha,
            Err(err) => {
                let reason = format!("clone repository: {err}");
                return self.fail_with(scan, Error::Clone, &reason).await;
            }
        };
        span_record!(commit_sha, display commit_sha);

        self.queue
            .set_scan_workspace(&scan.id, &checkout.display().to_string(), &commit_sha)
            .await
            .change_context(Error::Queue)?;

        // Old workspaces are collected off the request path; the sweep never
        // touches the directory of the scan that spawned it.
        {
            let workspaces = self.workspaces.clone();
            let repo_name = repo.name().clone();
            let current = scan.id.clone();
            tokio::spawn(async move {
                if let Err(err) = workspaces.sweep(&repo_name, &current).await {
                    warn!("workspace sweep failed: {err:?}");
                }
            });
        }

        let stacks = match discover::discover_stacks(
            &checkout,
            repo.root_path().as_deref(),
            repo.ignore_paths(),
        ) {
            Ok(stacks) => stacks,
            Err(err) => {
                let reason = format!("discover stacks: {err}");
                return self.fail_with(scan, Error::NoStacksDiscovered, &reason).await;
            }
        };
        if stacks.is_empty() {
            return self
                .fail_with(scan, Error::NoStacksDiscovered, "no stacks discovered")
                .await;
        }

        let selected = match changed {
            Some(changed) => {
                let selected = discover::select_stacks_for_changes(&stacks, changed);
                if selected.is_empty() {
                    return self
                        .fail_with(
                            scan,
                            Error::NoMatchingStacks,
                            "no matching stacks for webhook changes",
                        )
                        .await;
                }
                selected
            }
            None => stacks,
        };
        info!("selected {} stacks", selected.len());

        let versions = match discover::detect_versions(&checkout, &selected) {
            Ok(versions) => versions,
            Err(err) => {
                let reason = format!("detect tool versions: {err}");
                return self.fail_with(scan, Error::DetectVersions, &reason).await;
            }
        };
        self.queue
            .set_scan_versions(&scan.id, &versions)
            .await
            .change_context(Error::Queue)?;
        self.queue
            .set_scan_total(&scan.id, selected.len())
            .await
            .change_context(Error::Queue)?;

        let mut outcome = EnqueueOutcome::default();
        for stack in selected {
            let stack_scan =
                queue::stack_scan_for(scan, repo.url().as_ref(), stack, self.options.max_retries);
            let id = stack_scan.id.clone();
            match self.queue.enqueue(stack_scan).await {
                Ok(()) => outcome.enqueued.push(id),
                Err(err) if matches!(err.current_context(), queue::Error::StackScanInflight) => {
                    outcome.skipped += 1;
                    self.queue
                        .mark_enqueue_skipped(&scan.id)
                        .await
                        .change_context(Error::Queue)?;
                }
                Err(err) => {
                    outcome
                        .failures
                        .push(self.workspaces.redact(&format!("enqueue {id}: {err}")));
                    self.queue
                        .mark_enqueue_failed(&scan.id)
                        .await
                        .change_context(Error::Queue)?;
                }
            }
        }

        if outcome.enqueued.is_empty() {
            self.queue
                .cancel_scan(&scan.id, &scan.repo, "all stacks inflight")
                .await
                .change_context(Error::Queue)?;
            return report!(Error::NoStacksEnqueued)
                .wrap_err()
                .attach_printable(format!("scan id: {}", scan.id));
        }
        if outcome.skipped > 0 || !outcome.failures.is_empty() {
            // Only enqueued stacks can ever report progress; shrink the
            // total so terminal reconciliation stays reachable.
            self.queue
                .set_scan_total(&scan.id, outcome.enqueued.len())
                .await
                .change_context(Error::Queue)?;
        }
        Ok(outcome)
    }

    /// Fail the scan with a sanitized reason, then surface `context`.
    async fn fail_with<T>(
        &self,
        scan: &Scan,
        context: Error,
        reason: &str,
    ) -> Result<T, Report<Error>> {
        let reason = self.workspaces.redact(reason);
        if let Err(err) = self.queue.fail_scan(&scan.id, &scan.repo, &reason).await {
            warn!(scan_id = %scan.id, "failed to record scan failure: {err:?}");
        }
        report!(context).wrap_err().attach_printable(reason)
    }
}
