//! Types and functions for parsing & validating CLI arguments.

use std::path::{Path, PathBuf};

use clap::Parser;
use error_stack::{report, Report};
use getset::Getters;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};

/// Environment variable overriding the data root location.
pub const DATA_ROOT_VAR: &str = "DRIFTMON_DATA_ROOT";

/// File name searched for in the data root when no config path is provided.
const CONFIG_FILE_NAMES: &[&str] = &["config.yml", "config.yaml"];

/// Errors that are possibly surfaced during validation of args.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The data root could not be determined or created.
    #[error("resolve data root")]
    DataRoot,

    /// The config file was not able to be located.
    #[error("locate config file")]
    ConfigFileLocation,
}

/// Base arguments, used in most driftmon subcommands.
/// The "Raw" prefix indicates that this is the initial parsed value before any validation.
///
/// These are parsed automatically by `clap` since they implement [`Parser`]
/// and are included in the top-level subcommand configuration; by the time
/// this type exists, parsing has already succeeded.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct RawArgs {
    /// The path to the driftmon config file.
    ///
    /// If unset, driftmon searches for `config.yml` or `config.yaml` in the
    /// current working directory and then in the data root.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// The driftmon data root, holding workspaces, the results database,
    /// and trace output.
    ///
    /// Defaults to `~/.config/driftmon`.
    #[arg(long, env = DATA_ROOT_VAR)]
    data_root: Option<PathBuf>,
}

impl RawArgs {
    /// Validate the raw args provided: resolve (and create) the data root
    /// and locate the config file.
    pub async fn validate(self) -> Result<RunArgs, Report<Error>> {
        let data_root = match self.data_root {
            Some(provided) => provided,
            None => default_data_root()?,
        };
        tokio::fs::create_dir_all(&data_root)
            .await
            .context(Error::DataRoot)
            .describe_lazy(|| format!("creating data root {data_root:?}"))
            .help("ensure the data root location is writable")?;

        let config_path = match self.config {
            Some(provided) => provided,
            None => discover_config(&data_root)?,
        };

        RunArgs {
            config_path,
            data_root,
        }
        .wrap_ok()
    }

    /// Validate args for `init`, which must not require the config file to exist.
    pub async fn validate_init(self) -> Result<PathBuf, Report<Error>> {
        let data_root = match self.data_root {
            Some(provided) => provided,
            None => default_data_root()?,
        };
        tokio::fs::create_dir_all(&data_root)
            .await
            .context(Error::DataRoot)
            .describe_lazy(|| format!("creating data root {data_root:?}"))?;
        Ok(data_root)
    }
}

/// Validated arguments, used in most driftmon subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct RunArgs {
    /// The path to the config file on disk.
    config_path: PathBuf,

    /// The data root.
    data_root: PathBuf,
}

fn default_data_root() -> Result<PathBuf, Report<Error>> {
    dirs::home_dir()
        .map(|home| home.join(".config").join("driftmon"))
        .ok_or_else(|| report!(Error::DataRoot))
        .help("set an explicit data root with '--data-root'")
}

fn discover_config(data_root: &Path) -> Result<PathBuf, Report<Error>> {
    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(CONFIG_FILE_NAMES.iter().map(|name| cwd.join(name)));
    }
    candidates.extend(CONFIG_FILE_NAMES.iter().map(|name| data_root.join(name)));

    for candidate in &candidates {
        if candidate.is_file() {
            return candidate.clone().wrap_ok();
        }
    }
    report!(Error::ConfigFileLocation)
        .wrap_err()
        .describe("searches for 'config.yml' or 'config.yaml' in the working directory and data root")
        .help("consider providing an explicit '--config' argument, or run 'driftmon init'")
}
