//! Implementation for the `run` subcommand: the long-lived worker process.

use std::sync::Arc;
use std::time::Duration;

use error_stack::{Result, ResultExt};
use tap::TapFallible;
use tracing::{debug, info};

use crate::broker::redis::RedisBroker;
use crate::broker::Broker;
use crate::config::{Config, RunArgs};
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::queue::Queue;
use crate::repo::RepoProvider;
use crate::runner::ExecRunner;
use crate::store;
use crate::worker::WorkerPool;
use crate::workspace::Workspaces;

/// Errors encountered during runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Setting up the broker connection, store, or worker pool failed.
    #[error("set up worker process")]
    Setup,

    /// Application health check failed.
    #[error("health check failed")]
    Healthcheck,
}

/// The primary entrypoint: start the worker pool and run until interrupted.
#[tracing::instrument(skip_all, fields(subcommand = "run"))]
pub async fn main(args: &RunArgs, config: Config) -> Result<(), Error> {
    let broker = Arc::new(
        RedisBroker::connect(config.broker_url().as_str())
            .await
            .change_context(Error::Setup)?,
    );
    let queue = Arc::new(Queue::new(Arc::clone(&broker), config.queue().clone()));
    let store = Arc::new(
        store::connect_sqlite(&args.data_root().join("results.db"))
            .await
            .change_context(Error::Setup)?,
    );
    let workspaces = Workspaces::new(args.data_root(), config.workspace_retention());
    let runner = Arc::new(ExecRunner::new(config.evaluator().clone()));
    let repos: Arc<dyn RepoProvider> = Arc::new(config.repos().clone());

    let pool = WorkerPool::new(
        queue,
        runner,
        store,
        repos,
        workspaces,
        config.worker().clone(),
    );
    pool.start().await;
    info!("driftmon worker process is up");

    // Run until the OS asks us to stop, then drain in-flight work.
    tokio::select! {
        biased;

        result = tokio::signal::ctrl_c() => {
            info!("shutting down on OS signal");
            pool.stop().await;
            result.context(Error::Setup)
        }

        result = healthcheck(broker.as_ref()) => result,
    }
}

/// Conduct internal diagnostics to ensure driftmon is still in a good state.
#[tracing::instrument(skip_all)]
async fn healthcheck<B: Broker>(broker: &B) -> Result<(), Error> {
    for _ in 0.. {
        broker
            .healthcheck()
            .await
            .tap_ok(|_| debug!("broker healthcheck ok"))
            .change_context(Error::Healthcheck)
            .describe("driftmon periodically pings the broker to validate that it is still reachable")
            .help("this may be a temporary condition; the broker retry budget was already spent before this surfaced")?;

        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    Ok(())
}
