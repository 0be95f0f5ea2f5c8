//! Implementation for the `scan` subcommand: trigger one scan from the CLI.
//!
//! The scan is enqueued against the shared broker; a `run` process (this one
//! or any other against the same broker) consumes the stack scans.

use std::sync::Arc;

use error_stack::{Result, ResultExt};
use tracing::info;

use crate::broker::redis::RedisBroker;
use crate::config::{Config, RunArgs};
use crate::orchestrator::Orchestrator;
use crate::queue::Queue;
use crate::repo::{RepoName, RepoProvider};
use crate::scan::Trigger;
use crate::workspace::Workspaces;

/// Errors encountered triggering a scan.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Setting up the broker connection failed.
    #[error("set up broker connection")]
    Setup,

    /// The provided repository name is invalid or not configured.
    #[error("resolve repository")]
    ResolveRepo,

    /// Starting the scan failed.
    #[error("start scan")]
    StartScan,
}

/// Trigger a manual scan of one configured repository.
#[tracing::instrument(skip(args, config), fields(subcommand = "scan"))]
pub async fn main(
    args: &RunArgs,
    config: Config,
    repo: &str,
    commit: Option<String>,
    actor: &str,
) -> Result<(), Error> {
    let name = RepoName::try_from(repo).change_context(Error::ResolveRepo)?;
    let repo = config
        .repos()
        .get(&name)
        .await
        .change_context(Error::ResolveRepo)?;

    let broker = Arc::new(
        RedisBroker::connect(config.broker_url().as_str())
            .await
            .change_context(Error::Setup)?,
    );
    let queue = Arc::new(Queue::new(broker, config.queue().clone()));
    let workspaces = Workspaces::new(args.data_root(), config.workspace_retention());
    let orchestrator = Orchestrator::new(queue, workspaces, config.orchestrator().clone());

    let (scan, outcome) = orchestrator
        .start_and_enqueue(&repo, Trigger::Manual, commit, actor)
        .await
        .change_context(Error::StartScan)?;

    info!(
        scan_id = %scan.id,
        "enqueued {} stacks ({} skipped, {} failed)",
        outcome.enqueued.len(),
        outcome.skipped,
        outcome.failures.len(),
    );
    for failure in &outcome.failures {
        info!("enqueue failure: {failure}");
    }
    Ok(())
}
