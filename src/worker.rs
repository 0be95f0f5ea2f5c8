//! The worker pool: concurrent consumers of stack scans.
//!
//! Each worker loops on claiming a stack scan, staging a private copy of the
//! stack's workspace subtree, invoking the evaluator, persisting the result,
//! and reporting progress back through the queue. Workers in any number of
//! processes may share one broker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::queue::{ProgressOutcome, Queue, StackOutcome};
use crate::repo::RepoProvider;
use crate::runner::{RunParams, Runner};
use crate::scan::{ScanId, StackScan};
use crate::store::Store;
use crate::workspace::Workspaces;

/// Errors surfaced from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A queue operation failed.
    #[error("queue operation")]
    Queue,
}

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of concurrent workers in this process.
    pub concurrency: usize,

    /// How long one claim attempt blocks before re-checking for shutdown.
    pub claim_wait: Duration,

    /// How often an in-flight evaluation polls its parent scan for cancellation.
    pub cancel_poll: Duration,

    /// How long `stop` waits for in-flight evaluations before abandoning them.
    pub stop_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: 4,
            claim_wait: Duration::from_secs(3),
            cancel_poll: Duration::from_secs(2),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// A pool of stack scan workers.
pub struct WorkerPool<B, R, S> {
    worker: Worker<B, R, S>,
    options: Options,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Broker, R: Runner, S: Store> WorkerPool<B, R, S> {
    /// Create a pool. Workers don't run until [`WorkerPool::start`].
    pub fn new(
        queue: Arc<Queue<B>>,
        runner: Arc<R>,
        store: Arc<S>,
        repos: Arc<dyn RepoProvider>,
        workspaces: Workspaces,
        options: Options,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker: Worker {
                queue,
                runner,
                store,
                repos,
                workspaces,
                options: options.clone(),
            },
            options,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the configured number of workers.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for index in 0..self.options.concurrency.max(1) {
            let worker = self.worker.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                debug!("worker {index} starting");
                worker.run(shutdown).await;
                debug!("worker {index} stopped");
            }));
        }
        info!("started {} workers", handles.len());
    }

    /// Signal workers to stop and wait (bounded) for in-flight work.
    ///
    /// Workers finish the stack scan they hold; anything past `stop_grace`
    /// is abandoned, to be retried after the scan lock lapses.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        let drain = async {
            for handle in handles.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.options.stop_grace, drain).await.is_err() {
            warn!("workers did not stop within grace period");
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// One worker's context; cheap to clone into each task.
struct Worker<B, R, S> {
    queue: Arc<Queue<B>>,
    runner: Arc<R>,
    store: Arc<S>,
    repos: Arc<dyn RepoProvider>,
    workspaces: Workspaces,
    options: Options,
}

impl<B, R, S> Clone for Worker<B, R, S> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
            repos: Arc::clone(&self.repos),
            workspaces: self.workspaces.clone(),
            options: self.options.clone(),
        }
    }
}

impl<B: Broker, R: Runner, S: Store> Worker<B, R, S> {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let claimed = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                claimed = self.queue.claim(self.options.claim_wait) => claimed,
            };
            match claimed {
                Ok(Some(stack_scan)) => {
                    if let Err(err) = self.handle(stack_scan).await {
                        warn!("stack scan handling failed: {err:?}");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("claim failed: {err:?}");
                    // The queue already retried; give the broker a breather.
                    tokio::time::sleep(self.options.claim_wait).await;
                }
            }
        }
    }

    #[tracing::instrument(skip(self, stack_scan), fields(id = %stack_scan.id, stack = %stack_scan.stack))]
    async fn handle(&self, stack_scan: StackScan) -> Result<(), Report<Error>> {
        // The parent scan may have gone terminal while this sat queued;
        // cancellation owns the record in that case, nothing to count.
        let scan = match self.queue.get_scan(&stack_scan.scan_id).await {
            Ok(scan) => scan,
            Err(err)
                if matches!(err.current_context(), crate::queue::Error::ScanNotFound) =>
            {
                debug!("parent scan is gone; dropping stack scan");
                return Ok(());
            }
            Err(err) => return Err(err.change_context(Error::Queue)),
        };
        if scan.status.is_terminal() {
            debug!("parent scan is terminal; dropping stack scan");
            return Ok(());
        }

        let Some(stack_scan) = self
            .queue
            .mark_stack_running(&stack_scan)
            .await
            .change_context(Error::Queue)?
        else {
            debug!("stack scan no longer pending; dropping");
            return Ok(());
        };

        let Some(workspace) = scan.workspace.as_deref() else {
            return self
                .finish(
                    &stack_scan,
                    StackOutcome::Failed {
                        error: String::from("scan has no workspace checkout"),
                        evaluator_error: false,
                    },
                )
                .await;
        };

        // Private copy first: workspace GC of older scans can then never
        // race with the evaluator reading files.
        let staged = match self
            .workspaces
            .stage_stack(Path::new(workspace), &stack_scan.stack)
            .await
        {
            Ok(staged) => staged,
            Err(err) => {
                let reason = self.workspaces.redact(&format!("stage workspace: {err}"));
                return self.retry_or_fail(&stack_scan, reason).await;
            }
        };

        let (tf_version, tg_version) = scan.versions.resolve(&stack_scan.stack);
        // Evaluators that fetch modules need the repo's transport auth; a
        // repo dropped from configuration mid-scan degrades to anonymous.
        let auth = self
            .repos
            .get(&stack_scan.repo)
            .await
            .map(|config| config.git().clone())
            .unwrap_or_default();
        let params = RunParams {
            repo: stack_scan.repo.clone(),
            repo_url: stack_scan.repo_url.clone(),
            stack: stack_scan.stack.clone(),
            tf_version,
            tg_version,
            auth,
            workspace: staged.stack_dir(),
        };

        // Dropping the runner future on cancellation kills the evaluator
        // (its child process is kill-on-drop).
        let outcome = tokio::select! {
            outcome = self.runner.run(params) => outcome,
            _ = self.watch_cancellation(&stack_scan.scan_id) => {
                info!("parent scan canceled; abandoning evaluation");
                return Ok(());
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                let reason = self.workspaces.redact(&format!("run evaluator: {err}"));
                return self.retry_or_fail(&stack_scan, reason).await;
            }
        };

        // A cancellation that landed after the evaluator finished still wins:
        // canceled stack scans must not persist results.
        match self.queue.get_scan(&stack_scan.scan_id).await {
            Ok(scan) if scan.status.is_terminal() => {
                info!("parent scan terminal after evaluation; discarding result");
                return Ok(());
            }
            _ => {}
        }

        if let Err(err) = self
            .store
            .save_result(&stack_scan.repo, &stack_scan.stack, &result)
            .await
        {
            let reason = self.workspaces.redact(&format!("persist result: {err}"));
            return self
                .finish(
                    &stack_scan,
                    StackOutcome::Failed {
                        error: reason,
                        evaluator_error: false,
                    },
                )
                .await;
        }

        let outcome = if result.is_error() {
            StackOutcome::Failed {
                error: self.workspaces.redact(&result.error),
                evaluator_error: true,
            }
        } else {
            StackOutcome::Completed {
                drifted: result.drifted,
            }
        };
        self.finish(&stack_scan, outcome).await
    }

    /// Requeue an infrastructure failure while budget remains; terminal otherwise.
    async fn retry_or_fail(
        &self,
        stack_scan: &StackScan,
        reason: String,
    ) -> Result<(), Report<Error>> {
        if stack_scan.retries < stack_scan.max_retries {
            let requeued = self
                .queue
                .requeue_retry(stack_scan, &reason)
                .await
                .change_context(Error::Queue)?;
            if requeued {
                debug!(
                    "requeued (retry {}/{})",
                    stack_scan.retries + 1,
                    stack_scan.max_retries
                );
                return Ok(());
            }
            // Canceled underneath us; nothing to do.
            return Ok(());
        }
        self.finish(
            stack_scan,
            StackOutcome::Failed {
                error: reason,
                evaluator_error: false,
            },
        )
        .await
    }

    async fn finish(
        &self,
        stack_scan: &StackScan,
        outcome: StackOutcome,
    ) -> Result<(), Report<Error>> {
        let progressed = self
            .queue
            .progress(stack_scan, outcome)
            .await
            .change_context(Error::Queue)?;
        if progressed == ProgressOutcome::ScanFinished {
            info!(scan_id = %stack_scan.scan_id, "scan finished");
        }
        Ok(())
    }

    /// Resolves when the parent scan reaches a terminal state.
    async fn watch_cancellation(&self, scan_id: &ScanId) {
        loop {
            tokio::time::sleep(self.options.cancel_poll).await;
            match self.queue.get_scan(scan_id).await {
                Ok(scan) if scan.status.is_terminal() => return,
                Ok(_) => {}
                // A missing record means the scan was evicted; treat as canceled.
                Err(err)
                    if matches!(err.current_context(), crate::queue::Error::ScanNotFound) =>
                {
                    return;
                }
                Err(err) => {
                    warn!("cancellation poll failed: {err:?}");
                }
            }
        }
    }
}
