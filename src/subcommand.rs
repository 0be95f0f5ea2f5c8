//! Subcommand implementations for the driftmon binary.

use std::path::Path;

use error_stack::{report, Result, ResultExt};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::ext::error_stack::ErrorHelper;
use crate::ext::result::{WrapErr, WrapOk};

pub mod init;
pub mod run;
pub mod scan;

/// Errors setting up shared subcommand infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Installing the tracing subscriber failed.
    #[error("install tracing sink")]
    TracingSink,
}

/// Install the tracing sinks: human-readable console output filtered by
/// `RUST_LOG`, plus JSON traces rotated hourly under `<dataRoot>/trace`.
///
/// The returned guard must be held for the process lifetime; dropping it
/// stops the background writer and loses buffered trace output.
pub fn run_tracing_sink(data_root: &Path) -> Result<WorkerGuard, Error> {
    let file_appender = tracing_appender::rolling::hourly(data_root.join("trace"), "driftmon.trace");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console = tracing_subscriber::fmt::layer().with_target(false).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let file = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer);

    match tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
    {
        Ok(()) => guard.wrap_ok(),
        Err(err) => report!(Error::TracingSink)
            .wrap_err()
            .attach_printable(err.to_string())
            .help("a tracing subscriber may already be installed in this process"),
    }
}
