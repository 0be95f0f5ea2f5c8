//! Interactions and data types for the driftmon config file live here.

use error_stack::{Result, ResultExt};

// Keep `config` opaque externally, only export what is required for callers.
// To re-export a symbol, just `pub use`.
mod args;
mod file;

pub use args::{RawArgs, RunArgs, DATA_ROOT_VAR};
pub use file::{Config, Repos};

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// This crate doesn't actually parse command line arguments, it only validates them.
    /// It hands off parsing to `clap` by exporting [`RawArgs`].
    ///
    /// Given this, the error message is only concerned with _validating_ the args,
    /// since `clap` already reports parse errors itself.
    #[error("validate command line arguments")]
    ValidateArgs,

    /// Unlike with args, this crate is responsible for both parsing and validating
    /// the config file, so [`file`] has its own errors reflecting that two-step process.
    /// At this level we just report the overall process as "loading".
    #[error("load config file")]
    LoadConfigFile,
}

/// Validate the args provided by the user.
pub async fn validate_args(provided: RawArgs) -> Result<RunArgs, Error> {
    provided.validate().await.change_context(Error::ValidateArgs)
}

/// Load the config for the application.
pub async fn load(args: &RunArgs) -> Result<Config, Error> {
    file::Config::load(args.config_path())
        .await
        .change_context(Error::LoadConfigFile)
}
