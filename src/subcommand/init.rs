//! Implementation for the `init` subcommand.

use std::path::Path;

use error_stack::{report, Result};
use indoc::indoc;
use tracing::info;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::WrapErr;

/// The starter config file written by `driftmon init`.
const CONFIG_TEMPLATE: &str = indoc! {r#"
    # driftmon configuration.
    version: 1

    # The Redis-compatible broker shared by every driftmon process.
    broker_url: redis://127.0.0.1:6379/0

    # How many stack evaluations this process runs concurrently.
    concurrency: 4

    scan:
      # How long the per-repo scan lock lives between renewals.
      lock_ttl: 60s
      # A scan older than this is considered stuck and loses its lock.
      max_age: 2h
      # Lock renewal period; keep at or under a third of lock_ttl.
      renew_every: 15s
      # Retry budget for transient stack evaluation failures.
      max_retries: 1

    workspace:
      # Cloned workspaces kept per repository.
      retention: 3

    # Repositories to watch.
    repos: []
    #  - name: infra
    #    url: https://example.com/infra.git
    #    branch: main
    #    root_path: stacks
    #    ignore_paths:
    #      - modules
    #    cancel_inflight_on_new_trigger: true
    #    auth:
    #      type: http_basic
    #      username: ci
    #      password: <token>
"#};

/// Errors encountered during init.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A config file already exists.
    #[error("config file exists")]
    ConfigFileExists,

    /// Writing the config file failed.
    #[error("write config file")]
    WriteConfigFile,
}

/// Generate a starter config file in the data root.
#[tracing::instrument]
pub async fn main(data_root: &Path) -> Result<(), Error> {
    let target = data_root.join("config.yml");
    if target.exists() {
        return report!(Error::ConfigFileExists)
            .wrap_err()
            .describe_lazy(|| format!("config file location: {target:?}"))
            .help("edit the existing file, or remove it to start over");
    }

    tokio::fs::write(&target, CONFIG_TEMPLATE)
        .await
        .context(Error::WriteConfigFile)
        .describe_lazy(|| format!("writing {target:?}"))
        .help("ensure the data root is writable")?;

    info!("wrote starter config to {target:?}");
    Ok(())
}
