//! Types and functions for parsing & validating config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use delegate::delegate;
use error_stack::{report, Report, ResultExt};
use getset::{CopyGetters, Getters};
use serde::Deserialize;
use url::Url;

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};
use crate::ext::result::{WrapErr, WrapOk};
use crate::ext::secrecy::ComparableSecretString;
use crate::git;
use crate::orchestrator;
use crate::queue;
use crate::repo::{self, RepoConfig, RepoName, RepoProvider, RepoUrl};
use crate::runner::ExecConfig;
use crate::worker;

/// Errors that are possibly surfaced during parsing and validation of the config file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the file from disk failed.
    #[error("read config file")]
    Read,

    /// The file did not parse as YAML in the expected shape.
    #[error("parse config file")]
    Parse,

    /// Parsed values failed validation.
    #[error("validate parsed config file values")]
    Validate,
}

/// Config values as parsed from disk.
/// The "Raw" prefix indicates that this is the initial parsed value before any validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    broker_url: String,

    concurrency: Option<i32>,

    #[serde(default)]
    scan: RawScan,

    #[serde(default)]
    workspace: RawWorkspace,

    #[serde(default)]
    evaluator: RawEvaluator,

    #[serde(default)]
    repos: Vec<RawRepo>,

    #[serde(rename(deserialize = "version"))]
    _version: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScan {
    lock_ttl: Option<String>,
    max_age: Option<String>,
    renew_every: Option<String>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkspace {
    retention: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEvaluator {
    terraform_bin: Option<PathBuf>,
    terragrunt_bin: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepo {
    name: String,
    url: String,
    branch: Option<String>,
    root_path: Option<String>,

    #[serde(default)]
    ignore_paths: Vec<String>,

    #[serde(default)]
    cancel_inflight_on_new_trigger: bool,

    auth: Option<RawAuth>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
enum RawAuth {
    #[serde(rename = "ssh_key_file")]
    SshKeyFile { path: PathBuf },

    #[serde(rename = "ssh_key")]
    SshKey { key: String },

    #[serde(rename = "http_header")]
    HttpHeader { header: String },

    #[serde(rename = "http_basic")]
    HttpBasic { username: String, password: String },

    #[serde(rename = "none")]
    None,
}

impl From<RawAuth> for git::Auth {
    fn from(value: RawAuth) -> Self {
        match value {
            RawAuth::SshKeyFile { path } => git::Auth::SshKeyFile { path },
            RawAuth::SshKey { key } => git::Auth::SshKey {
                key: ComparableSecretString::from(key),
            },
            RawAuth::HttpHeader { header } => git::Auth::HttpHeader {
                header: ComparableSecretString::from(header),
            },
            RawAuth::HttpBasic { username, password } => git::Auth::HttpBasic {
                username,
                password: ComparableSecretString::from(password),
            },
            RawAuth::None => git::Auth::None,
        }
    }
}

/// Validated config values to use during the program runtime.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Config {
    /// The broker connection URL.
    #[getset(get = "pub")]
    broker_url: Url,

    /// Worker concurrency for this process.
    #[getset(get_copy = "pub")]
    concurrency: usize,

    /// Queue tuning.
    #[getset(get = "pub")]
    queue: queue::Options,

    /// Orchestrator tuning.
    #[getset(get = "pub")]
    orchestrator: orchestrator::Options,

    /// Worker pool tuning.
    #[getset(get = "pub")]
    worker: worker::Options,

    /// How many workspaces to keep per repo.
    #[getset(get_copy = "pub")]
    workspace_retention: usize,

    /// Evaluator binary overrides.
    #[getset(get = "pub")]
    evaluator: ExecConfig,

    /// Configured repositories.
    #[getset(get = "pub")]
    repos: Repos,
}

impl Config {
    /// The concurrency used when the config file doesn't provide one.
    pub const DEFAULT_CONCURRENCY: usize = 4;

    /// The workspace retention used when the config file doesn't provide one.
    pub const DEFAULT_WORKSPACE_RETENTION: usize = 3;

    /// Load and validate the config file at the provided location.
    pub async fn load(location: &Path) -> Result<Self, Report<Error>> {
        let content = tokio::fs::read_to_string(location)
            .await
            .context(Error::Read)
            .describe_lazy(|| format!("reading config file at {location:?}"))
            .help("run 'driftmon init' to generate a starter config file")?;
        let raw: RawConfig = serde_yaml::from_str(&content).context(Error::Parse)?;
        validate(raw)
    }
}

fn validate(raw: RawConfig) -> Result<Config, Report<Error>> {
    let broker_url = Url::parse(&raw.broker_url)
        .context(Error::Validate)
        .describe_lazy(|| format!("provided broker url: '{}'", raw.broker_url))?;
    if !matches!(broker_url.scheme(), "redis" | "rediss" | "redis+unix") {
        return report!(Error::Validate)
            .wrap_err()
            .describe_lazy(|| format!("provided broker url: '{broker_url}'"))
            .help("the broker url must use the 'redis://' or 'rediss://' scheme");
    }

    let concurrency = raw
        .concurrency
        .map(|c| match c {
            i32::MIN..=0 => Config::DEFAULT_CONCURRENCY,
            c => c as usize,
        })
        .unwrap_or(Config::DEFAULT_CONCURRENCY);

    let defaults = queue::Options::default();
    let lock_ttl = parse_duration_field(raw.scan.lock_ttl, "scan.lock_ttl", defaults.lock_ttl)?;
    let orchestrator_defaults = orchestrator::Options::default();
    let max_age = parse_duration_field(
        raw.scan.max_age,
        "scan.max_age",
        orchestrator_defaults.scan_max_age,
    )?;
    let renew_every = parse_duration_field(
        raw.scan.renew_every,
        "scan.renew_every",
        lock_ttl / 4,
    )?;
    if renew_every > lock_ttl / 3 {
        return report!(Error::Validate)
            .wrap_err()
            .describe_lazy(|| {
                format!("renew_every {renew_every:?} against lock_ttl {lock_ttl:?}")
            })
            .help("'scan.renew_every' must be at most a third of 'scan.lock_ttl' so transient broker failures don't drop the lock");
    }

    let queue_options = queue::Options {
        lock_ttl,
        ..defaults
    };
    let orchestrator_options = orchestrator::Options {
        max_retries: raw.scan.max_retries.unwrap_or(1),
        scan_max_age: max_age,
        renew_every,
    };
    let worker_options = worker::Options {
        concurrency,
        ..worker::Options::default()
    };

    let repos = raw
        .repos
        .into_iter()
        .map(validate_repo)
        .collect::<Result<Vec<_>, Report<Error>>>()
        .map(Repos)?;

    Config {
        broker_url,
        concurrency,
        queue: queue_options,
        orchestrator: orchestrator_options,
        worker: worker_options,
        workspace_retention: raw
            .workspace
            .retention
            .unwrap_or(Config::DEFAULT_WORKSPACE_RETENTION)
            .max(1),
        evaluator: ExecConfig {
            terraform_bin: raw.evaluator.terraform_bin,
            terragrunt_bin: raw.evaluator.terragrunt_bin,
        },
        repos,
    }
    .wrap_ok()
}

fn validate_repo(raw: RawRepo) -> Result<RepoConfig, Report<Error>> {
    let name = RepoName::try_from(raw.name).change_context(Error::Validate)?;
    let url = RepoUrl::try_from(raw.url).change_context(Error::Validate)?;
    let ignore_paths = raw
        .ignore_paths
        .into_iter()
        .map(|path| {
            let trimmed = path.trim_matches('/').to_string();
            if trimmed.is_empty() {
                report!(Error::Validate)
                    .wrap_err()
                    .describe("ignore paths may not be empty")
            } else {
                trimmed.wrap_ok()
            }
        })
        .collect::<Result<Vec<_>, Report<Error>>>()?;

    RepoConfig::builder()
        .name(name)
        .url(url)
        .branch(raw.branch)
        .root_path(raw.root_path)
        .ignore_paths(ignore_paths)
        .cancel_inflight_on_new_trigger(raw.cancel_inflight_on_new_trigger)
        .git(raw.auth.map(git::Auth::from).unwrap_or_default())
        .build()
        .wrap_ok()
}

fn parse_duration_field(
    raw: Option<String>,
    field: &str,
    default: Duration,
) -> Result<Duration, Report<Error>> {
    match raw {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw)
            .context(Error::Validate)
            .describe_lazy(|| format!("provided '{field}': '{raw}'")),
    }
}

/// The validated repository set, which is also the config-backed [`RepoProvider`].
#[derive(Debug, Clone, Default)]
pub struct Repos(Vec<RepoConfig>);

impl Repos {
    delegate! {
        to self.0 {
            /// Iterate over configured repositories.
            pub fn iter(&self) -> impl Iterator<Item = &RepoConfig>;

            /// Whether any repositories are configured.
            pub fn is_empty(&self) -> bool;
        }
    }
}

#[async_trait]
impl RepoProvider for Repos {
    async fn get(&self, name: &RepoName) -> Result<RepoConfig, Report<repo::Error>> {
        self.0
            .iter()
            .find(|config| config.name() == name)
            .cloned()
            .ok_or_else(|| report!(repo::Error::RepoNotFound))
            .attach_printable_lazy(|| format!("repo: {name}"))
    }

    async fn list(&self) -> Result<Vec<RepoConfig>, Report<repo::Error>> {
        Ok(self.0.clone())
    }
}
